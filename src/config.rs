//! Configuration table
//!
//! Loaded once at startup from a plain `key=value` text file:
//!
//! ```text
//! # Address beacons are bound to and sent towards
//! BroadcastAddress=169.254.255.255
//! ```
//!
//! Leading whitespace is stripped; empty lines and lines starting with `#`
//! are skipped. Every other line must contain `=` with a non-empty key in
//! front of it; anything else is a fatal startup error. Values are plain
//! strings; [`get_as`](ConfigTable::get_as) parses them on lookup and callers
//! supply their own defaults.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::{fmt, fs};

/// Key/value store backing all startup configuration.
#[derive(Debug, Default)]
pub struct ConfigTable {
    table: HashMap<String, String>,
}

impl ConfigTable {
    /// Load and parse the file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        content.parse()
    }

    /// Raw string lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.table.get(key).map(String::as_str)
    }

    /// Typed lookup; `None` when the key is absent or the value does not
    /// parse.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl FromStr for ConfigTable {
    type Err = Error;

    fn from_str(content: &str) -> Result<Self> {
        let mut table = HashMap::new();
        for (number, raw) in content.lines().enumerate() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let separator = line.find('=').ok_or_else(|| {
                Error::Config(format!("line {}: missing '=' separator", number + 1))
            })?;
            if separator == 0 {
                return Err(Error::Config(format!("line {}: empty key", number + 1)));
            }
            let key = &line[..separator];
            let value = &line[separator + 1..];
            table.insert(key.to_string(), value.to_string());
        }
        Ok(ConfigTable { table })
    }
}

impl fmt::Display for ConfigTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration entries", self.table.len())
    }
}
