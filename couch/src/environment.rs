//! Everything outside this process that we talk to
//!
//! Bundles the configuration with the process, liveness and server
//! backends so they can be swapped as a unit.

use std::sync::Arc;

use crate::config::{get_config, CouchConfig};
use crate::error::Result;
use crate::instance::launcher::{CouchdbCommand, ServerControl};
use crate::instance::liveness::{ProcessInspector, SystemInspector};
use crate::server::{Connector, HttpConnector};

#[derive(Clone)]
pub struct Environment {
    pub config: CouchConfig,
    pub control: Arc<dyn ServerControl>,
    pub inspector: Arc<dyn ProcessInspector>,
    pub connector: Arc<dyn Connector>,
}

impl Environment {
    /// Real CouchDB binary, sysinfo and HTTP for the given config
    pub fn from_config(config: CouchConfig) -> Self {
        Self {
            control: Arc::new(CouchdbCommand::new(&config)),
            inspector: Arc::new(SystemInspector),
            connector: Arc::new(HttpConnector),
            config,
        }
    }

    /// Like `from_config`, using the process-wide configuration
    pub fn system() -> Result<Self> {
        Ok(Self::from_config(get_config()?))
    }
}
