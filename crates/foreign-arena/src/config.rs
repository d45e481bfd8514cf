//! Runtime configuration, resolved from the environment.

use std::sync::OnceLock;

use thiserror::Error;
use tracing::warn;

/// Default size of an arena allocation chunk (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: usize = 64;

pub const TRACE_DOWNCALLS_VAR: &str = "FOREIGN_ARENA_TRACE_DOWNCALLS";
pub const CHUNK_SIZE_VAR: &str = "FOREIGN_ARENA_CHUNK_SIZE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got `{value}`")]
    InvalidBool { var: &'static str, value: String },
    #[error("{var}: expected a byte count of at least {min}, got `{value}`", min = MIN_CHUNK_SIZE)]
    InvalidChunkSize { var: &'static str, value: String },
}

/// Settings shared by every arena in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Log every native call made by the bridge and the cleanup protocol.
    pub trace_downcalls: bool,
    /// Chunk size for arena allocations.
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_downcalls: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(TRACE_DOWNCALLS_VAR) {
            config.trace_downcalls = parse_bool(&value).ok_or(ConfigError::InvalidBool {
                var: TRACE_DOWNCALLS_VAR,
                value,
            })?;
        }

        if let Some(value) = lookup(CHUNK_SIZE_VAR) {
            config.chunk_size = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|size| *size >= MIN_CHUNK_SIZE)
                .ok_or(ConfigError::InvalidChunkSize {
                    var: CHUNK_SIZE_VAR,
                    value,
                })?;
        }

        Ok(config)
    }

    /// The process-wide configuration, read from the environment once.
    pub fn global() -> &'static Config {
        static GLOBAL: OnceLock<Config> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring malformed configuration, using defaults");
                Self::default()
            })
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.trace_downcalls);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_reads_values() {
        let config = Config::from_lookup(lookup(&[
            (TRACE_DOWNCALLS_VAR, "Yes"),
            (CHUNK_SIZE_VAR, "4096"),
        ]))
        .unwrap();
        assert!(config.trace_downcalls);
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn test_rejects_malformed_values() {
        let err = Config::from_lookup(lookup(&[(TRACE_DOWNCALLS_VAR, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));

        let err = Config::from_lookup(lookup(&[(CHUNK_SIZE_VAR, "16")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChunkSize { .. }));

        let err = Config::from_lookup(lookup(&[(CHUNK_SIZE_VAR, "lots")])).unwrap_err();
        assert!(err.to_string().contains(CHUNK_SIZE_VAR));
    }
}
