use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::error::CouchError;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<CouchConfig>> = OnceCell::new();

/// Environment of the embedded CouchDB server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouchConfig {
    /// CouchDB launcher script
    pub couchdb_bin: PathBuf,

    /// System default config, loaded before our generated one
    pub default_ini: PathBuf,

    /// Seconds before the launcher respawns a crashed server
    pub respawn_delay: u32,

    /// Process name used when no name was recorded for an instance
    /// (Erlang shows up as `beam.smp`, or `beam` on single-processor systems)
    pub expected_process_name: String,

    /// URI file published by the desktop CouchDB service
    pub desktop_uri_file: Option<PathBuf>,

    /// Template for short record types, `$$` is replaced by the type name
    pub record_type_base: String,

    /// How long to wait for the pid file and the URI file
    pub startup_timeout_ms: u64,

    /// Poll interval while waiting
    pub poll_interval_ms: u64,

    /// Delay before reading a pid file that was just found
    pub pid_settle_ms: u64,

    /// Delay before reading a URI file that was just found
    pub uri_settle_ms: u64,
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            couchdb_bin: PathBuf::from("/usr/bin/couchdb"),
            default_ini: PathBuf::from("/etc/couchdb/default.ini"),
            respawn_delay: 1,
            expected_process_name: "beam.smp".to_string(),
            desktop_uri_file: None,
            record_type_base: "http://bbbsnowball.dyndns.org/couchdb/$$".to_string(),
            startup_timeout_ms: 20_000,
            poll_interval_ms: 200,
            pid_settle_ms: 100,
            uri_settle_ms: 100,
        }
    }
}

impl CouchConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn pid_settle(&self) -> Duration {
        Duration::from_millis(self.pid_settle_ms)
    }

    pub fn uri_settle(&self) -> Duration {
        Duration::from_millis(self.uri_settle_ms)
    }

    /// URI file of the desktop service, explicit or the usual cache location
    pub fn desktop_uri_file(&self) -> Option<PathBuf> {
        self.desktop_uri_file.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("desktop-couch").join("desktop-couchdb.uri"))
        })
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("couch").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("couch").join("config.toml"));
        paths.push(home_dir.join(".couch.toml"));
    }

    paths
}

/// Initialize configuration from default paths
pub fn init_config() -> Result<(), CouchError> {
    info!("Initializing configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return init_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    set_config(CouchConfig::default())
}

/// Initialize configuration from a specific path
pub fn init_config_from_path(path: &Path) -> Result<(), CouchError> {
    info!("Loading configuration from: {:?}", path);
    set_config(load_config(path)?)
}

/// Parse a config file without touching the global instance
pub fn load_config(path: &Path) -> Result<CouchConfig, CouchError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CouchError::Config(format!("Failed to read config: {}", e)))?;

    toml::from_str(&content)
        .map_err(|e| CouchError::Config(format!("Failed to parse config: {}", e)))
}

/// Set the global configuration
fn set_config(config: CouchConfig) -> Result<(), CouchError> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| CouchError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Current global configuration, defaults if never initialized
pub fn get_config() -> Result<CouchConfig, CouchError> {
    match CONFIG.get() {
        Some(lock) => lock
            .read()
            .map(|guard| guard.clone())
            .map_err(|e| CouchError::Config(format!("Failed to lock config: {}", e))),
        None => Ok(CouchConfig::default()),
    }
}
