//! Is the server in a directory still running, and is it ours?
//!
//! CouchDB daemonizes itself, so all we have is the pid file it writes and
//! whatever we recorded after starting it. A pid can be reused by an
//! unrelated process, so the pid alone proves nothing: the process must
//! also have the expected executable name, reference our config file on
//! its command line, and belong to our user.

use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tracing::{debug, error, info, warn};

/// Run state of an observed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    Zombie,
    Dead,
}

/// What the OS tells us about a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub name: String,
    pub cmdline: Vec<String>,
    /// Reading the executable path fails for processes of other users
    pub exe_readable: bool,
}

/// Source of process information
pub trait ProcessInspector: Send + Sync {
    /// Whether this environment can inspect processes at all
    fn is_supported(&self) -> bool;

    /// Snapshot of a process, `None` if there is no such process
    fn inspect(&self, pid: u32) -> Option<ProcessSnapshot>;
}

/// Process inspection backed by sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    fn is_supported(&self) -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }

    fn inspect(&self, pid: u32) -> Option<ProcessSnapshot> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;

        let state = match process.status() {
            ProcessStatus::Zombie => ProcessState::Zombie,
            ProcessStatus::Dead => ProcessState::Dead,
            _ => ProcessState::Alive,
        };

        Some(ProcessSnapshot {
            state,
            name: process.name().to_string(),
            cmdline: process.cmd().to_vec(),
            exe_readable: process
                .exe()
                .map(|exe| !exe.as_os_str().is_empty())
                .unwrap_or(false),
        })
    }
}

/// Outcome of a liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Verified to be the server we started
    Running(u32),
    /// Pid file exists but we cannot verify the process
    AssumedRunning(u32),
    NotRunning(NotRunningReason),
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        !matches!(self, Liveness::NotRunning(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotRunningReason {
    NoPidFile,
    NoSuchProcess,
    Defunct,
    WrongName { expected: String, actual: String },
    ForeignConfig,
    ForeignUser,
}

/// Read a pid file, waiting `settle` first so a writer can finish.
///
/// A file holding only a newline counts as no pid; CouchDB sometimes leaves
/// it that way even while running.
pub async fn read_pid_file(path: &Path, settle: Duration) -> Option<u32> {
    if !path.is_file() {
        return None;
    }

    tokio::time::sleep(settle).await;

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read pid file {:?}: {}", path, e);
            return None;
        }
    };

    if content.trim().is_empty() {
        return None;
    }

    match content.trim().parse::<u32>() {
        Ok(pid) => Some(pid),
        Err(_) => {
            warn!(
                "Invalid pid file for CouchDB, contents of {:?}: {:?}",
                path, content
            );
            None
        }
    }
}

/// What a process must look like to count as our server
pub struct Expectation<'a> {
    /// Recorded process name, `None` falls back to `default_name`
    pub recorded_name: Option<&'a str>,
    pub default_name: &'a str,
    /// Config file that must appear on the command line
    pub config_file: &'a Path,
    /// Command line recorded after the last start
    pub recorded_cmdline: Option<&'a str>,
}

/// Check a pid against what we expect to find
pub fn check_process(
    inspector: &dyn ProcessInspector,
    pid: u32,
    expected: &Expectation<'_>,
) -> Liveness {
    if !inspector.is_supported() {
        error!(
            "Process inspection is not available here, cannot test whether CouchDB is running. \
             Assuming it is because a pid file exists"
        );
        return Liveness::AssumedRunning(pid);
    }

    let snapshot = match inspector.inspect(pid) {
        Some(snapshot) => snapshot,
        None => {
            debug!("Not running: no process with pid {}", pid);
            return Liveness::NotRunning(NotRunningReason::NoSuchProcess);
        }
    };

    if snapshot.state != ProcessState::Alive {
        debug!("Not running: process {} is {:?}", pid, snapshot.state);
        return Liveness::NotRunning(NotRunningReason::Defunct);
    }

    let expected_name = match expected.recorded_name {
        Some(name) => name,
        None => {
            warn!("We haven't saved the name of the process, so we have to guess");
            expected.default_name
        }
    };
    if snapshot.name != expected_name {
        debug!(
            "Not running: process {} is '{}' instead of '{}'",
            pid, snapshot.name, expected_name
        );
        return Liveness::NotRunning(NotRunningReason::WrongName {
            expected: expected_name.to_string(),
            actual: snapshot.name,
        });
    }

    let config_file = expected.config_file.to_string_lossy();
    if !snapshot.cmdline.iter().any(|arg| *arg == config_file) {
        debug!("Not running: {} is not on the command line of {}", config_file, pid);
        return Liveness::NotRunning(NotRunningReason::ForeignConfig);
    }

    if let Some(recorded) = expected.recorded_cmdline {
        let actual = super::info::ProcessIdentity::cmdline_repr(&snapshot.cmdline);
        if actual != recorded {
            info!(
                "Command line of CouchDB process is different than the one we expected.\n  expected: {}\n  actual:   {}",
                recorded, actual
            );
        }
    }

    if !snapshot.exe_readable {
        debug!("Not running: process {} belongs to a different user", pid);
        return Liveness::NotRunning(NotRunningReason::ForeignUser);
    }

    Liveness::Running(pid)
}
