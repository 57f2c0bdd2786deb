//! Couch - CouchDB servers behind a single locator string
//!
//! Finds, starts, supervises and connects to CouchDB servers, whether they
//! are the desktop service, a remote server, or a private server in a
//! directory that is started on demand.
//!
//! ## Module Organization
//!
//! - `couch`: locator resolution and the connection handle
//! - `instance/`: private servers in a directory (config, liveness, launch)
//! - `database` / `record`: record access and design documents
//! - `server`: the CouchDB REST API we use, over HTTP
//! - `memory`: in-process server for tests
//! - `config/`: configuration management
//! - `forward`: debug access from other machines

pub mod config;
pub mod couch;
pub mod database;
pub mod environment;
pub mod error;
pub mod forward;
pub mod instance;
pub mod locator;
pub mod memory;
pub mod options;
pub mod record;
pub mod sequence;
pub mod server;
pub mod view;

pub use couch::Couch;
pub use database::Database;
pub use environment::Environment;
pub use error::{CouchError, Result};
pub use forward::DebugForwarder;
pub use instance::{InstanceState, ManagedInstance};
pub use locator::Locator;
pub use options::{AdditionalOption, AdditionalOptions};
pub use record::Record;
pub use sequence::TimeSequence;
pub use server::{CouchServer, Document};
pub use view::{ViewQuery, ViewResult, ViewRow};
