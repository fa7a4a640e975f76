//! Environment variable parsing utilities.

use std::env;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Utility for parsing environment variables with an optional prefix.
pub struct EnvParser {
    prefix: Option<String>,
}

impl EnvParser {
    /// Create a new environment parser without prefix.
    pub fn new() -> Self {
        Self { prefix: None }
    }

    /// Create a new environment parser with prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            None
        } else {
            let mut p = prefix.to_uppercase();
            if !p.ends_with('_') {
                p.push('_');
            }
            Some(p)
        };

        Self { prefix }
    }

    fn get_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Get a non-empty string value from environment.
    pub fn get_string(&self, key: &str) -> Option<String> {
        env::var(self.get_key(key)).ok().filter(|v| !v.is_empty())
    }

    /// Get a boolean value from environment.
    pub fn get_bool(&self, key: &str) -> SyncResult<Option<bool>> {
        match self.get_string(key) {
            Some(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "true" | "yes" | "1" | "on" => true,
                    "false" | "no" | "0" | "off" => false,
                    _ => {
                        return Err(SyncError::Configuration(format!(
                            "{}: invalid boolean value '{}'",
                            self.get_key(key),
                            value
                        )))
                    }
                };
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Get a u32 value from environment.
    pub fn get_u32(&self, key: &str) -> SyncResult<Option<u32>> {
        self.parse_numeric(key)
    }

    /// Get a u64 value from environment.
    pub fn get_u64(&self, key: &str) -> SyncResult<Option<u64>> {
        self.parse_numeric(key)
    }

    fn parse_numeric<T>(&self, key: &str) -> SyncResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_string(key) {
            Some(value) => {
                let parsed = value.parse::<T>().map_err(|e| {
                    SyncError::Configuration(format!(
                        "{}: invalid numeric value '{}': {}",
                        self.get_key(key),
                        value,
                        e
                    ))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Get a comma-separated list of strings from environment.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.get_string(key).map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
