//! Additional options of a managed instance
//!
//! Options come from the query part of a `file://` or `tmp://` locator:
//! `stats=no&httpd:port=5984&any`. Each `&`-separated token is a
//! `:`-separated name path with an optional `=value`; name segments and the
//! value are percent-decoded independently.

use std::fmt;

use crate::error::{CouchError, Result};

/// Accept whatever instance is already running in the directory
pub const ANY_OPTION: &str = "any";

/// Keep the stats subsystem of CouchDB enabled
pub const STATS_OPTION: &str = "stats";

/// A single decoded option
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdditionalOption {
    pub name: Vec<String>,
    pub value: Option<String>,
}

impl AdditionalOption {
    pub fn new<S: Into<String>>(name: Vec<S>, value: Option<&str>) -> Self {
        Self {
            name: name.into_iter().map(Into::into).collect(),
            value: value.map(str::to_string),
        }
    }

    fn decode(token: &str) -> Result<Self> {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (token, None),
        };

        let name = name
            .split(':')
            .map(percent_decode)
            .collect::<Result<Vec<_>>>()?;
        let value = match value {
            Some(value) if !value.is_empty() => Some(percent_decode(value)?),
            _ => None,
        };

        Ok(Self { name, value })
    }

    /// `section:key` options end up in the generated config file
    pub fn as_config_entry(&self) -> Option<(&str, &str, &str)> {
        match self.name.as_slice() {
            [section, key] => Some((
                section.as_str(),
                key.as_str(),
                self.value.as_deref().unwrap_or(""),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for AdditionalOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: Vec<String> = self
            .name
            .iter()
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        write!(f, "{}", name.join(":"))?;
        if let Some(value) = self.value.as_deref().filter(|v| !v.is_empty()) {
            write!(f, "={}", urlencoding::encode(value))?;
        }
        Ok(())
    }
}

fn percent_decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| CouchError::InvalidLocator(format!("Bad percent-encoding in '{}': {}", raw, e)))
}

/// Ordered list of options as given by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdditionalOptions {
    options: Vec<AdditionalOption>,
}

impl AdditionalOptions {
    pub fn new(options: Vec<AdditionalOption>) -> Self {
        Self { options }
    }

    /// Decode the query part of a locator; `None` or empty yields no options
    pub fn parse(query: Option<&str>) -> Result<Self> {
        let query = match query {
            Some(q) if !q.is_empty() => q,
            _ => return Ok(Self::default()),
        };

        let options = query
            .split('&')
            .map(AdditionalOption::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { options })
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdditionalOption> {
        self.options.iter()
    }

    /// Value of the first option with exactly this name path.
    ///
    /// The outer `Option` tells whether the option is present at all.
    pub fn get(&self, name: &[&str]) -> Option<Option<&str>> {
        self.options
            .iter()
            .find(|opt| opt.name.iter().map(String::as_str).eq(name.iter().copied()))
            .map(|opt| opt.value.as_deref())
    }

    /// Boolean reading of a single-segment option.
    ///
    /// Present without a value means `true`, as does any value other than
    /// `no`, `0` or `false`.
    pub fn flag(&self, name: &str) -> bool {
        match self.get(&[name]) {
            None => false,
            Some(None) => true,
            Some(Some(value)) => {
                !matches!(value.to_lowercase().as_str(), "no" | "0" | "false")
            }
        }
    }

    /// Options that map directly onto `section:key = value` config entries
    pub fn config_entries(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.options.iter().filter_map(AdditionalOption::as_config_entry)
    }

    /// Canonical form of the options that influence the server config.
    ///
    /// Only used to compare against the value stored at the last start;
    /// never parsed back.
    pub fn fingerprint(&self) -> String {
        let mut options: Vec<&AdditionalOption> = self
            .options
            .iter()
            .filter(|opt| !(opt.name.len() == 1 && opt.name[0] == ANY_OPTION))
            .collect();
        options.sort();

        options
            .iter()
            .map(|opt| opt.to_string())
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = AdditionalOptions::parse(Some("stats=no&httpd:port=5984&any")).unwrap();

        assert_eq!(options.get(&["stats"]), Some(Some("no")));
        assert_eq!(options.get(&["httpd", "port"]), Some(Some("5984")));
        assert_eq!(options.get(&["any"]), Some(None));
        assert_eq!(options.get(&["httpd"]), None);
    }

    #[test]
    fn test_parse_decodes_segments_independently() {
        let options = AdditionalOptions::parse(Some("log%3Ax:level=a%26b%3Dc")).unwrap();
        let option = options.iter().next().unwrap();

        assert_eq!(option.name, vec!["log:x".to_string(), "level".to_string()]);
        assert_eq!(option.value.as_deref(), Some("a&b=c"));
    }

    #[test]
    fn test_parse_empty_query() {
        assert!(AdditionalOptions::parse(None).unwrap().is_empty());
        assert!(AdditionalOptions::parse(Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_flag() {
        let options = AdditionalOptions::parse(Some("a&b=no&c=FALSE&d=0&e=yes&f=1")).unwrap();

        assert!(options.flag("a"));
        assert!(!options.flag("b"));
        assert!(!options.flag("c"));
        assert!(!options.flag("d"));
        assert!(options.flag("e"));
        assert!(options.flag("f"));
        assert!(!options.flag("missing"));
    }

    #[test]
    fn test_config_entries_only_two_segments() {
        let options = AdditionalOptions::parse(Some("stats=no&httpd:port=5984&a:b:c=d&log:level")).unwrap();
        let entries: Vec<_> = options.config_entries().collect();

        assert_eq!(entries, vec![("httpd", "port", "5984"), ("log", "level", "")]);
    }

    #[test]
    fn test_fingerprint_ignores_order_and_any() {
        let a = AdditionalOptions::parse(Some("stats=no&httpd:port=5984&any")).unwrap();
        let b = AdditionalOptions::parse(Some("httpd:port=5984&stats=no")).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "httpd:port=5984&stats=no");
    }

    #[test]
    fn test_fingerprint_encodes_values() {
        let options = AdditionalOptions::new(vec![AdditionalOption::new(
            vec!["admins", "me"],
            Some("a b&c"),
        )]);

        assert_eq!(options.fingerprint(), "admins:me=a%20b%26c");
    }

    #[test]
    fn test_fingerprint_differs_for_different_values() {
        let a = AdditionalOptions::parse(Some("stats=no")).unwrap();
        let b = AdditionalOptions::parse(Some("stats=yes")).unwrap();

        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
