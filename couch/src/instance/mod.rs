//! Private CouchDB servers living in a directory
//!
//! A managed directory holds the generated config, the pid and URI files
//! CouchDB writes, our notes in `config.txt`, plus `log/` and `data/`.
//!
//! `ManagedInstance::ensure_running` is entered on every connect:
//! - probe the pid file and the process behind it
//! - not running: write the config and launch the server, wait for its pid
//! - running with other options: warn, the config of a live server stays
//! - wait for the published URI and connect with the stored admin account

pub mod info;
pub mod ini;
pub mod launcher;
pub mod layout;
pub mod liveness;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use info::{Credentials, InstanceInfo, ProcessIdentity};
pub use ini::IniConfig;
pub use launcher::{CouchdbCommand, ServerControl};
pub use layout::Layout;
pub use liveness::{Liveness, NotRunningReason, ProcessInspector, SystemInspector};

use crate::config::CouchConfig;
use crate::environment::Environment;
use crate::error::{CouchError, Result};
use crate::options::{AdditionalOptions, ANY_OPTION, STATS_OPTION};
use crate::server::CouchServer;
use liveness::{check_process, read_pid_file, Expectation, ProcessState};

/// Action run once when the instance is shut down
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Stats handlers removed from the config unless the `stats` option is set
const STATS_ENTRIES: [(&str, &str); 5] = [
    ("stats", "rate"),
    ("stats", "samples"),
    ("httpd_global_handlers", "_stats"),
    ("daemons", "stats_collector"),
    ("daemons", "stats_aggregator"),
];

/// What we can tell about a directory without touching it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No instance info, the directory was never used
    NoInfo,
    Stopped,
    /// Running, but the URI hasn't been published yet
    Starting,
    Running,
    /// A pid file exists but the process can't be verified here
    Unknown,
}

/// Connection to a server we started or found running in a directory
pub struct ManagedInstance {
    env: Environment,
    layout: Layout,
    options: AdditionalOptions,
    info: InstanceInfo,
    credentials: Credentials,
    uri: String,
    server: Arc<dyn CouchServer>,
    shutdown_hooks: Vec<ShutdownHook>,
}

impl ManagedInstance {
    /// Attach to the server in `dir`, starting one if none of ours is running
    pub async fn ensure_running(
        dir: impl Into<PathBuf>,
        options: AdditionalOptions,
        env: &Environment,
    ) -> Result<Self> {
        let layout = Layout::new(dir);
        let mut info = InstanceInfo::load(&layout.info_file())?.unwrap_or_default();

        let liveness = probe(&layout, &info, env).await;
        if liveness.is_running() {
            debug!("CouchDB in {} is running: {:?}", layout.dir().display(), liveness);
            if let Some((requested, used)) = options_drift(&options, &info) {
                warn!(
                    "The server is already running, so we cannot change its options!\n  requested options: {}\n  used options:      {}",
                    requested, used
                );
            }
        } else {
            debug!("CouchDB in {} is not running: {:?}", layout.dir().display(), liveness);
            write_config(&layout, &options, &mut info)?;
            launch(&layout, &mut info, env).await?;
        }

        let credentials = info.credentials().ok_or_else(|| {
            CouchError::Config(format!(
                "No credentials recorded in {}",
                layout.info_file().display()
            ))
        })?;
        let uri = with_credentials(&wait_for_uri(&layout, &env.config).await?, &credentials);
        let server = env.connector.connect(&uri)?;

        Ok(Self {
            env: env.clone(),
            layout,
            options,
            info,
            credentials,
            uri,
            server,
            shutdown_hooks: Vec::new(),
        })
    }

    /// Inspect a directory without starting anything
    pub async fn state(dir: impl Into<PathBuf>, env: &Environment) -> Result<InstanceState> {
        let layout = Layout::new(dir);
        let info = InstanceInfo::load(&layout.info_file())?;
        let liveness = probe(&layout, &info.clone().unwrap_or_default(), env).await;

        Ok(match (info, liveness) {
            (_, Liveness::AssumedRunning(_)) => InstanceState::Unknown,
            (_, Liveness::Running(_)) if !layout.uri_file().exists() => InstanceState::Starting,
            (_, Liveness::Running(_)) => InstanceState::Running,
            (None, Liveness::NotRunning(_)) => InstanceState::NoInfo,
            (Some(_), Liveness::NotRunning(_)) => InstanceState::Stopped,
        })
    }

    pub fn dir(&self) -> &Path {
        self.layout.dir()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Server URI including the admin credentials
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn server(&self) -> Arc<dyn CouchServer> {
        self.server.clone()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn options(&self) -> &AdditionalOptions {
        &self.options
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    /// Run `hook` after the server has been stopped by `shutdown`
    pub fn on_shutdown<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown_hooks.push(Box::new(hook));
    }

    /// Soft restart through the control endpoint, then reconnect.
    ///
    /// The URI file is removed first so the new one can be told apart. If
    /// the server refuses, the pid and URI files get their previous content
    /// back, so the still running server can be found again.
    pub async fn restart(&mut self) -> Result<()> {
        let pid_file = self.layout.pid_file();
        let uri_file = self.layout.uri_file();
        let previous_pid = tokio::fs::read_to_string(&pid_file).await.ok();
        let previous_uri = tokio::fs::read_to_string(&uri_file).await.ok();

        self.layout.remove_file(&uri_file)?;

        if let Err(e) = self.server.restart().await {
            for (path, content) in [(&pid_file, previous_pid), (&uri_file, previous_uri)] {
                if let Some(content) = content {
                    if let Err(write_err) = tokio::fs::write(path, content).await {
                        warn!("Failed to restore {:?}: {}", path, write_err);
                    }
                }
            }
            return Err(CouchError::RestartFailed(e.to_string()));
        }

        info!("Restarted CouchDB instance in {}", self.layout.dir().display());
        self.reconnect().await
    }

    /// Stop the server, then run the shutdown hooks once in order
    pub async fn shutdown(&mut self) -> Result<()> {
        let stopped = self.env.control.stop(&self.layout).await;

        for hook in self.shutdown_hooks.drain(..) {
            hook();
        }

        stopped
    }

    async fn reconnect(&mut self) -> Result<()> {
        let uri = wait_for_uri(&self.layout, &self.env.config).await?;
        self.uri = with_credentials(&uri, &self.credentials);
        self.server = self.env.connector.connect(&self.uri)?;
        Ok(())
    }
}

impl fmt::Debug for ManagedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("dir", &self.layout.dir())
            .field("options", &self.options)
            .field("server", &self.server.display_url())
            .finish()
    }
}

/// Config for a managed server; most settings come from the system default.ini
pub fn generate_config(
    layout: &Layout,
    options: &AdditionalOptions,
    credentials: &Credentials,
    cookie_secret: &str,
) -> IniConfig {
    let mut config = IniConfig::new();

    // HTTP basic auth or cookies only
    config.set("couch_httpd_auth", "require_valid_user", "true");
    config.set(
        "couch_httpd_auth",
        "authentication_handlers",
        "{couch_httpd_auth, cookie_authentication_handler}, {couch_httpd_auth, default_authentication_handler}",
    );
    config.set("httpd", "WWW-Authenticate", "Basic realm=\"bookmarkable-user-auth\"");

    // random port on the local interface, published through the URI file
    config.set("httpd", "bind_address", "127.0.0.1");
    config.set("httpd", "port", "0");
    config.set("couchdb", "uri_file", &layout.uri_file().to_string_lossy());

    config.set("log", "file", &layout.log_file().to_string_lossy());
    config.set("log", "level", "info");

    let data_dir = layout.data_dir();
    config.set("couchdb", "view_index_dir", &data_dir.to_string_lossy());
    config.set("couchdb", "database_dir", &data_dir.to_string_lossy());

    config.set("couch_httpd_auth", "secret", cookie_secret);
    config.set("admins", &credentials.user, &credentials.password);

    if !options.flag(STATS_OPTION) {
        for (section, key) in STATS_ENTRIES {
            config.delete(section, key);
        }
    }

    for (section, key, value) in options.config_entries() {
        config.set(section, key, value);
    }

    config
}

/// Put `user:password@` in front of the host part of `uri`
pub fn with_credentials(uri: &str, credentials: &Credentials) -> String {
    uri.replacen(
        "://",
        &format!("://{}:{}@", credentials.user, credentials.password),
        1,
    )
}

/// Requested and used fingerprints when they differ, unless `any` is given
pub fn options_drift(options: &AdditionalOptions, info: &InstanceInfo) -> Option<(String, String)> {
    if options.flag(ANY_OPTION) {
        return None;
    }

    let requested = options.fingerprint();
    let used = info.options_fingerprint().unwrap_or("");
    if requested == used {
        None
    } else {
        Some((requested, used.to_string()))
    }
}

async fn probe(layout: &Layout, info: &InstanceInfo, env: &Environment) -> Liveness {
    let pid = match read_pid_file(&layout.pid_file(), env.config.pid_settle()).await {
        Some(pid) => pid,
        None => return Liveness::NotRunning(NotRunningReason::NoPidFile),
    };

    let config_file = layout.config_file();
    let expected = Expectation {
        recorded_name: info.process_name(),
        default_name: &env.config.expected_process_name,
        config_file: &config_file,
        recorded_cmdline: info.process_cmdline(),
    };
    check_process(env.inspector.as_ref(), pid, &expected)
}

fn write_config(layout: &Layout, options: &AdditionalOptions, info: &mut InstanceInfo) -> Result<()> {
    layout.create_dirs()?;

    let credentials = match info.credentials() {
        Some(credentials) => credentials,
        None => {
            let credentials = Credentials::random();
            info.set_credentials(&credentials);
            credentials
        }
    };
    let cookie_secret = info.cookie_secret();

    let config = generate_config(layout, options, &credentials, &cookie_secret);
    info.set_options_fingerprint(&options.fingerprint());

    info.save(&layout.info_file())?;
    config.save(&layout.config_file())
}

async fn launch(layout: &Layout, info: &mut InstanceInfo, env: &Environment) -> Result<()> {
    layout.remove_file(&layout.pid_file())?;
    layout.remove_file(&layout.uri_file())?;

    env.control.start(layout).await?;
    let pid = wait_for_pid(layout, &env.config).await?;

    if !env.inspector.is_supported() {
        return Ok(());
    }
    match env.inspector.inspect(pid) {
        Some(snapshot) if snapshot.state == ProcessState::Alive => {
            info.set_process_identity(&ProcessIdentity {
                name: snapshot.name,
                cmdline: snapshot.cmdline,
            });
            info.save(&layout.info_file())?;
        }
        _ => debug!("CouchDB process {} is already gone after start", pid),
    }
    Ok(())
}

async fn wait_for_pid(layout: &Layout, config: &CouchConfig) -> Result<u32> {
    let path = layout.pid_file();
    let deadline = Instant::now() + config.startup_timeout();

    loop {
        if let Some(pid) = read_pid_file(&path, config.pid_settle()).await {
            return Ok(pid);
        }
        if Instant::now() >= deadline {
            warn!(
                "pid file hasn't been created before the timeout, so our best bet is that the server is not starting for some reason"
            );
            return Err(CouchError::StartupTimeout {
                path: path.display().to_string(),
                seconds: config.startup_timeout().as_secs_f64(),
            });
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}

/// Wait for the server to publish the URI it is bound to
async fn wait_for_uri(layout: &Layout, config: &CouchConfig) -> Result<String> {
    let path = layout.uri_file();
    let deadline = Instant::now() + config.startup_timeout();

    loop {
        if path.is_file() {
            // the server may still be writing
            tokio::time::sleep(config.uri_settle()).await;
            let uri = tokio::fs::read_to_string(&path).await?;
            let uri = uri.trim();
            if !uri.is_empty() {
                return Ok(uri.to_string());
            }
        }
        if Instant::now() >= deadline {
            return Err(CouchError::UriNotPublished {
                path: path.display().to_string(),
                seconds: config.startup_timeout().as_secs_f64(),
            });
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}
