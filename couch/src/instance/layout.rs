use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File layout of a managed instance directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    dir: PathBuf,
}

impl Layout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generated server config
    pub fn config_file(&self) -> PathBuf {
        self.dir.join("couch.ini")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("couch.pid")
    }

    /// The server writes its bound address here
    pub fn uri_file(&self) -> PathBuf {
        self.dir.join("couch.uri")
    }

    /// Our own notes about the instance
    pub fn info_file(&self) -> PathBuf {
        self.dir.join("config.txt")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.join("log")
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.log_dir().join("couchdb.out")
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.log_dir().join("couchdb.err")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("couchdb.log")
    }

    /// Databases and view indexes share one directory
    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    /// Remove a file if it exists
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
