//! Reaching a private server from another machine
//!
//! Managed servers only listen on 127.0.0.1. For debugging, `socat` can
//! forward the same port on the public interface; the URLs handed out are
//! rewritten to the public address while the forwarder is active.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{CouchError, Result};

static RE_LOCAL_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*(127\.0\.0\.1|localhost):([0-9]+)").unwrap());
static RE_LOCAL_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"127\.0\.0\.1|localhost").unwrap());

/// Futon is served below the server root
pub fn futon_url(server_uri: &str, dbname: Option<&str>) -> String {
    let mut url = server_uri.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str("_utils/");
    if let Some(dbname) = dbname {
        url.push_str("database.html?");
        url.push_str(dbname);
    }
    url
}

pub struct DebugForwarder {
    uri: String,
    dbname: Option<String>,
    local: bool,
    active: bool,
    public_ip: Option<IpAddr>,
    process: Option<Child>,
}

impl DebugForwarder {
    /// A `local` forwarder never forwards and can be used without activation
    pub fn new(uri: &str, dbname: Option<&str>, local: bool) -> Self {
        Self {
            uri: uri.to_string(),
            dbname: dbname.map(str::to_string),
            local,
            active: false,
            public_ip: None,
            process: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start forwarding if the server only listens locally
    pub async fn activate(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }

        if !self.local {
            if let Some(caps) = RE_LOCAL_PORT.captures(&self.uri) {
                info!("Forwarding the connection from a public port");
                let ip = public_ip().await?;
                let port = &caps[2];

                // fails to bind if the port is already public, which is fine
                let child = Command::new("socat")
                    .arg(format!("TCP-LISTEN:{},fork,bind={}", port, ip))
                    .arg(format!("TCP:127.0.0.1:{}", port))
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        CouchError::UnsupportedBackend(format!("Failed to start socat: {}", e))
                    })?;

                self.process = Some(child);
                self.public_ip = Some(ip);
            }
        }

        self.active = true;
        Ok(())
    }

    /// Stop forwarding
    pub async fn deactivate(&mut self) {
        self.active = false;
        self.public_ip = None;

        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop forwarding process: {}", e);
            }
        }
    }

    pub fn couch_url(&self) -> Result<String> {
        self.ensure_active()?;
        Ok(match self.public_ip {
            Some(ip) => RE_LOCAL_HOST
                .replace_all(&self.uri, ip.to_string().as_str())
                .into_owned(),
            None => self.uri.clone(),
        })
    }

    pub fn futon_url(&self) -> Result<String> {
        Ok(futon_url(&self.couch_url()?, self.dbname.as_deref()))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.local || self.active {
            Ok(())
        } else {
            Err(CouchError::ForwarderInactive)
        }
    }
}

impl fmt::Display for DebugForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.futon_url() {
            Ok(url) if self.active => write!(f, "{}", url),
            _ => write!(f, "DebugForwarder(inactive)"),
        }
    }
}

impl Drop for DebugForwarder {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Address of the interface that routes to the internet
async fn public_ip() -> Result<IpAddr> {
    local_ip_towards(("google.com", 80)).await
}

/// Local address the OS picks for traffic to `target`
async fn local_ip_towards<A: ToSocketAddrs>(target: A) -> Result<IpAddr> {
    // connecting a UDP socket sends nothing
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_futon_url() {
        assert_eq!(
            futon_url("http://u:p@127.0.0.1:5984/", None),
            "http://u:p@127.0.0.1:5984/_utils/"
        );
        assert_eq!(
            futon_url("http://example.org:5984", Some("mail")),
            "http://example.org:5984/_utils/database.html?mail"
        );
    }

    #[test]
    fn test_local_forwarder_needs_no_activation() {
        let forwarder = DebugForwarder::new("http://u:p@127.0.0.1:5984/", Some("mail"), true);

        assert_eq!(forwarder.couch_url().unwrap(), "http://u:p@127.0.0.1:5984/");
        assert_eq!(
            forwarder.futon_url().unwrap(),
            "http://u:p@127.0.0.1:5984/_utils/database.html?mail"
        );
    }

    #[test]
    fn test_inactive_forwarder_has_no_urls() {
        let forwarder = DebugForwarder::new("http://u:p@127.0.0.1:5984/", None, false);

        match forwarder.couch_url() {
            Err(CouchError::ForwarderInactive) => {}
            other => panic!("Expected ForwarderInactive, got {:?}", other),
        }
        assert_eq!(forwarder.to_string(), "DebugForwarder(inactive)");
    }

    #[tokio::test]
    async fn test_local_ip_lookup() {
        let ip = local_ip_towards("127.0.0.1:9").await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn test_public_server_is_not_forwarded() {
        let mut forwarder = DebugForwarder::new("http://example.org:5984/", Some("mail"), false);

        forwarder.activate().await.unwrap();
        assert!(forwarder.is_active());
        assert!(forwarder.process.is_none());
        assert_eq!(
            forwarder.to_string(),
            "http://example.org:5984/_utils/database.html?mail"
        );

        forwarder.deactivate().await;
        assert!(!forwarder.is_active());
    }
}
