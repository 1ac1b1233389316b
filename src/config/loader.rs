//! TOML loader for relay definitions

use crate::config::error::{ConfigError, ConfigResult};
use crate::distribution::{self, DistributionParams};
use crate::relay::{DelayPolicy, RelayConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// A whole configuration document
///
/// Entries are kept as raw TOML tables and decoded one at a time, so a
/// mistyped value or unknown key only invalidates the entry it appears in.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxiesFile {
    #[serde(default)]
    proxies: Vec<toml::Value>,
}

/// One `[[proxies]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    /// Listen address, `IP:PORT`
    pub bind_addr: String,

    /// Target address, `IP:PORT`
    pub connect_addr: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay model for both directions, or client to target only when
    /// `downstream_distribution` is present
    pub distribution: DistributionEntry,

    /// Delay model for target to client
    #[serde(default)]
    pub downstream_distribution: Option<DistributionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionEntry {
    /// Registry name, case-insensitive
    pub name: String,

    #[serde(default)]
    pub params: DistributionParams,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl ProxiesFile {
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(path),
            source,
        })
    }

    /// Number of `[[proxies]]` tables, valid or not
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Decode each entry on its own
    pub fn entries(&self) -> Vec<ConfigResult<ProxyEntry>> {
        self.proxies
            .iter()
            .enumerate()
            .map(|(index, value)| decode_entry(index, value))
            .collect()
    }

    /// Validate every entry independently
    ///
    /// An invalid entry yields an error in its slot without affecting the
    /// others, so callers can run the valid relays and report the rest.
    pub fn resolve(&self) -> ConfigResult<Vec<ConfigResult<RelayConfig>>> {
        if self.proxies.is_empty() {
            return Err(ConfigError::NoProxies);
        }

        Ok(self
            .proxies
            .iter()
            .enumerate()
            .map(|(index, value)| decode_entry(index, value)?.resolve(index))
            .collect())
    }
}

impl ProxyEntry {
    /// Build the relay configuration for the entry at `index`
    pub fn resolve(&self, index: usize) -> ConfigResult<RelayConfig> {
        let listen_addr = address(index, "bind_addr", &self.bind_addr)?;
        let connect_addr = address(index, "connect_addr", &self.connect_addr)?;

        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::InvalidChunkSize {
                index,
                size: self.chunk_size,
            });
        }

        let upstream = self.distribution.build(index)?;
        let delay = match &self.downstream_distribution {
            Some(downstream) => DelayPolicy::per_direction(upstream, downstream.build(index)?),
            None => DelayPolicy::shared(upstream),
        };

        RelayConfig::new(listen_addr, connect_addr, self.chunk_size, delay)
            .map_err(|source| ConfigError::Relay { index, source })
    }
}

impl DistributionEntry {
    fn build(&self, index: usize) -> ConfigResult<distribution::Distribution> {
        distribution::build(&self.name, &self.params)
            .map_err(|source| ConfigError::Distribution { index, source })
    }
}

fn decode_entry(index: usize, value: &toml::Value) -> ConfigResult<ProxyEntry> {
    value
        .clone()
        .try_into::<ProxyEntry>()
        .map_err(|source| ConfigError::InvalidEntry { index, source })
}

/// Parse an `IP:PORT` string
///
/// Host names are rejected; IPv6 literals need brackets (`[::1]:9000`).
pub fn parse_socket_addr(value: &str) -> Result<SocketAddr, String> {
    value.trim().parse::<SocketAddr>().map_err(|_| {
        "expected an IP literal and a port in 0-65535, e.g. 127.0.0.1:9000".to_string()
    })
}

fn address(index: usize, field: &'static str, value: &str) -> ConfigResult<SocketAddr> {
    parse_socket_addr(value).map_err(|reason| ConfigError::InvalidAddress {
        index,
        field,
        value: value.to_string(),
        reason,
    })
}
