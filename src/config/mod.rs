//! Declarative relay configuration
//!
//! Loads a TOML document with a `proxies` list and turns each entry into a
//! [`RelayConfig`](crate::relay::RelayConfig) bound to its distribution.

pub mod error;
pub mod loader;

pub use error::{ConfigError, ConfigResult};
pub use loader::{parse_socket_addr, DistributionEntry, ProxiesFile, ProxyEntry};
