//! INI file for the embedded CouchDB server
//!
//! CouchDB's parser has a few quirks that matter for generated values
//! (see `parse_ini_file` in couch_config.erl):
//! - it splits at `\s*=\s*` and joins the rest with a bare `=`, so spaces
//!   next to an equals sign inside a value are lost
//! - whitespace followed by `;` starts a comment
//! - a line starting with a space continues the previous value
//! - an empty value removes a value inherited from an earlier file

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::Result;

static RE_SPACE_EQUALS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+=|=\s+").unwrap());
static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t];").unwrap());
static RE_LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new("(\r\n|\n|\r|\x1a) ?").unwrap());

/// Problems CouchDB would have with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueWarning {
    /// A space next to `=` will be dropped
    SpaceNextToEquals,
    /// Everything after ` ;` is read as a comment
    CommentTruncation,
    /// Line breaks were turned into continuation lines
    LineBreak,
}

/// Accumulated `[section] key = value` entries
#[derive(Debug, Clone, Default)]
pub struct IniConfig {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)
            .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
            .map(|(_, value)| value.as_str())
    }

    /// Set a value, replacing an earlier value for the same key
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let index = match self.sections.iter().position(|(name, _)| name == section) {
            Some(index) => index,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };

        let entries = &mut self.sections[index].1;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Remove a value set by a config file loaded before this one
    pub fn delete(&mut self, section: &str, key: &str) {
        self.set(section, key, "");
    }

    /// Render the file, logging values CouchDB would misread
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (section, entries) in &self.sections {
            let _ = writeln!(out, "[{}]", section);
            for (key, value) in entries {
                let (value, warnings) = check_value(value);
                for warning in &warnings {
                    log_warning(*warning, section, key, &value);
                }
                let _ = writeln!(out, "{} = {}", key, value);
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

/// Check a value against the parser quirks and fix what can be fixed
pub fn check_value(value: &str) -> (String, Vec<ValueWarning>) {
    let mut warnings = Vec::new();

    if RE_SPACE_EQUALS.is_match(value) {
        warnings.push(ValueWarning::SpaceNextToEquals);
    }
    if RE_COMMENT.is_match(value) {
        warnings.push(ValueWarning::CommentTruncation);
    }

    let value = if RE_LINE_BREAK.is_match(value) {
        warnings.push(ValueWarning::LineBreak);
        RE_LINE_BREAK.replace_all(value, "$1 ").into_owned()
    } else {
        value.to_string()
    };

    (value, warnings)
}

fn log_warning(warning: ValueWarning, section: &str, key: &str, value: &str) {
    match warning {
        ValueWarning::SpaceNextToEquals => warn!(
            "The value for '{}:{}' contains a space next to an equal sign, CouchDB will drop the space",
            section, key
        ),
        ValueWarning::CommentTruncation => warn!(
            "Part of the value for '{}:{}' will be treated as a comment and ignored: {:?}",
            section, key, value
        ),
        ValueWarning::LineBreak => warn!(
            "The value for '{}:{}' contains a line break which CouchDB will replace by a space",
            section, key
        ),
    }
}
