//! Starting and stopping the server process
//!
//! The `couchdb` launcher script daemonizes the server and respawns it when
//! it crashes. We never wait on the server process itself: success is
//! judged by the pid and URI files showing up.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use super::layout::Layout;
use crate::config::CouchConfig;
use crate::error::{CouchError, Result};

/// Launch and stop commands for a managed server
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Fire off the server in the background
    async fn start(&self, layout: &Layout) -> Result<()>;

    /// Ask the server to shut down
    async fn stop(&self, layout: &Layout) -> Result<()>;
}

/// The `couchdb` launcher script
#[derive(Debug, Clone)]
pub struct CouchdbCommand {
    bin: PathBuf,
    default_ini: PathBuf,
    respawn_delay: u32,
}

impl CouchdbCommand {
    pub fn new(config: &CouchConfig) -> Self {
        Self {
            bin: config.couchdb_bin.clone(),
            default_ini: config.default_ini.clone(),
            respawn_delay: config.respawn_delay,
        }
    }

    /// Skip the system config, but load the system default.ini before ours
    fn config_args(&self, layout: &Layout) -> Vec<OsString> {
        vec![
            OsString::from("-n"),
            OsString::from("-a"),
            OsString::from(&self.default_ini),
            OsString::from("-a"),
            OsString::from(layout.config_file()),
        ]
    }

    pub fn start_args(&self, layout: &Layout) -> Vec<OsString> {
        let mut args = self.config_args(layout);
        args.extend([
            OsString::from("-b"),
            OsString::from("-r"),
            OsString::from(self.respawn_delay.to_string()),
            OsString::from("-p"),
            OsString::from(layout.pid_file()),
            OsString::from("-o"),
            OsString::from(layout.stdout_file()),
            OsString::from("-e"),
            OsString::from(layout.stderr_file()),
        ]);
        args
    }

    pub fn stop_args(&self, layout: &Layout) -> Vec<OsString> {
        let mut args = self.config_args(layout);
        args.extend([
            OsString::from("-d"),
            OsString::from("-p"),
            OsString::from(layout.pid_file()),
        ]);
        args
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        let status = Command::new(&self.bin)
            .args(&args)
            .status()
            .await
            .map_err(|e| {
                CouchError::UnsupportedBackend(format!(
                    "Failed to run {}: {}",
                    self.bin.display(),
                    e
                ))
            })?;

        if !status.success() {
            warn!("{} {:?} exited with {}", self.bin.display(), args, status);
        }
        Ok(())
    }
}

#[async_trait]
impl ServerControl for CouchdbCommand {
    async fn start(&self, layout: &Layout) -> Result<()> {
        let args = self.start_args(layout);
        info!(
            "Starting CouchDB instance in {}: {} {:?}",
            layout.dir().display(),
            self.bin.display(),
            args
        );
        self.run(args).await
    }

    async fn stop(&self, layout: &Layout) -> Result<()> {
        let args = self.stop_args(layout);
        warn!(
            "Shutting down CouchDB instance in {}: {} {:?}",
            layout.dir().display(),
            self.bin.display(),
            args
        );
        self.run(args).await
    }
}
