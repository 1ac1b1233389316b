//! Prometheus metrics exporter
//!
//! Exposes metrics via HTTP for Prometheus scraping.

use crate::metrics::recorder::init_metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

static EXPORTER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Metrics server configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address to bind the metrics server
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    /// Create a new config with custom address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self { listen_addr: addr }
    }
}

/// Install the Prometheus recorder and start its HTTP listener
///
/// Must be called from within a Tokio runtime. Only the first call installs
/// anything; later calls fail with [`MetricsError::AlreadyInitialized`].
pub fn start_metrics_server(config: MetricsConfig) -> Result<(), MetricsError> {
    if EXPORTER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(MetricsError::AlreadyInitialized);
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .install()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;

    // Descriptions only stick once a recorder is installed
    init_metrics();

    tracing::info!(addr = %config.listen_addr, "Prometheus exporter listening");
    Ok(())
}

/// Errors that can occur during metrics setup
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to setup metrics: {0}")]
    SetupFailed(String),

    #[error("Metrics already initialized")]
    AlreadyInitialized,
}
