//! Configuration error types

use crate::distribution::DistributionError;
use crate::relay::{RelayError, MAX_CHUNK_SIZE};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No proxies configured")]
    NoProxies,

    #[error("proxies[{index}]: invalid {field} {value:?}: {reason}")]
    InvalidAddress {
        index: usize,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("proxies[{index}]: {source}")]
    InvalidEntry {
        index: usize,
        #[source]
        source: toml::de::Error,
    },

    #[error("proxies[{index}]: chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {size}")]
    InvalidChunkSize { index: usize, size: usize },

    #[error("proxies[{index}]: {source}")]
    Distribution {
        index: usize,
        #[source]
        source: DistributionError,
    },

    #[error("proxies[{index}]: {source}")]
    Relay {
        index: usize,
        #[source]
        source: RelayError,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
