//! What we remember about a managed instance
//!
//! Stored as `key = value` lines in `config.txt` inside the instance
//! directory. Blank lines and lines starting with `#` are ignored. Keys we
//! don't know are kept as they are.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::Result;

const KEY_USER: &str = "user";
const KEY_PASS: &str = "pass";
const KEY_COOKIE_SECRET: &str = "cookie_secret";
const KEY_ADDITIONAL_OPTIONS: &str = "additional_options";
const KEY_PROCESS_NAME: &str = "process_name";
const KEY_PROCESS_CMDLINE: &str = "process_cmdline";

/// Admin account of a managed instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn random() -> Self {
        Self {
            user: random_token(),
            password: random_token(),
        }
    }
}

/// Executable name and command line of the server process we started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub name: String,
    pub cmdline: Vec<String>,
}

impl ProcessIdentity {
    /// Single-line form used in the info file and for comparison
    pub fn cmdline_repr(cmdline: &[String]) -> String {
        serde_json::to_string(cmdline).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    entries: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the info file, `None` if it is missing or empty
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)?;
        if content.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self::parse(&content)))
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim_start().trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) => {
                    entries.insert(key.trim().to_string(), value.trim_start().to_string());
                }
                None => warn!("Ignoring malformed line in instance info: {:?}", line),
            }
        }
        Self { entries }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{} = {}", key, value);
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            user: self.get(KEY_USER)?.to_string(),
            password: self.get(KEY_PASS)?.to_string(),
        })
    }

    pub fn set_credentials(&mut self, credentials: &Credentials) {
        self.set(KEY_USER, &credentials.user);
        self.set(KEY_PASS, &credentials.password);
    }

    /// Cookie secret, generated on first use and kept afterwards
    pub fn cookie_secret(&mut self) -> String {
        self.entries
            .entry(KEY_COOKIE_SECRET.to_string())
            .or_insert_with(random_token)
            .clone()
    }

    pub fn options_fingerprint(&self) -> Option<&str> {
        self.get(KEY_ADDITIONAL_OPTIONS)
    }

    pub fn set_options_fingerprint(&mut self, fingerprint: &str) {
        self.set(KEY_ADDITIONAL_OPTIONS, fingerprint);
    }

    pub fn process_name(&self) -> Option<&str> {
        self.get(KEY_PROCESS_NAME)
    }

    pub fn process_cmdline(&self) -> Option<&str> {
        self.get(KEY_PROCESS_CMDLINE)
    }

    pub fn set_process_identity(&mut self, identity: &ProcessIdentity) {
        self.set(KEY_PROCESS_NAME, &identity.name);
        self.set(
            KEY_PROCESS_CMDLINE,
            &ProcessIdentity::cmdline_repr(&identity.cmdline),
        );
    }
}

/// Random token that doesn't start with a digit and contains no `=`
pub fn random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    let encoded: String = BASE64
        .encode(bytes)
        .chars()
        .filter(|c| !matches!(c, '=' | '+' | '/'))
        .collect();
    format!("X{}", encoded)
}
