//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// key/value settings loaded once from a `key = value` text file
///
/// lookups never fail, an absent or malformed entry yields the zero value
/// of the requested type
#[derive(Clone, Debug, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    /// empty configuration, used when no file was given
    pub fn new() -> Self {
        Config::default()
    }

    /// load the configuration file at the given path
    /// an empty path is a valid "no configuration" case
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Ok(Config::new());
        }
        let content = fs::read(path).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Config::parse_bytes(&content))
    }

    /// parse raw file content, lines that are not valid utf-8 are decoded lossily
    pub fn parse_bytes(content: &[u8]) -> Self {
        let entries = content
            .split(|b| *b == b'\n')
            .filter_map(|line| parse_line(&String::from_utf8_lossy(line)))
            .collect();
        Config { entries }
    }

    /// parse configuration text, one entry per line
    pub fn parse(content: &str) -> Self {
        let entries = content.lines().filter_map(parse_line).collect();
        Config { entries }
    }

    /// raw value of the given key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// check whether the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// string value, empty when absent
    pub fn get_string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// integer value, 0 when absent or not a number
    pub fn get_int(&self, key: &str) -> i64 {
        self.get_int_or(key, 0)
    }

    /// integer value, `default` when absent, 0 when not a number
    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(value) => value.parse().unwrap_or(0),
            None => default,
        }
    }

    /// boolean value, false when absent or not a boolean
    /// numbers are true when non-zero. unlike the plain integer form the
    /// supervisor writes, `true`, `yes` and `on` are accepted too
    pub fn get_bool(&self, key: &str) -> bool {
        let Some(value) = self.get(key) else {
            return false;
        };
        if let Ok(number) = value.parse::<i64>() {
            return number != 0;
        }
        matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "yes" | "on"
        )
    }

    /// number of loaded entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// check whether nothing was loaded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// split one line into key & value
/// lines without `=`, empty keys and empty values are skipped
fn parse_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.trim().split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = strip_comment(value.trim()).trim();
    if value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// cut a trailing comment, a `#` only starts one after a tab or a space
fn strip_comment(value: &str) -> &str {
    let cut = ["\t#", " #"]
        .iter()
        .filter_map(|marker| value.find(marker))
        .min();
    match cut {
        Some(pos) => &value[..pos],
        None => value,
    }
}
