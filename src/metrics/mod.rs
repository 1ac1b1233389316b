//! Metrics and observability module
//!
//! Provides Prometheus-compatible metrics for monitoring relays.
//!
//! Key metrics exposed:
//! - Connections accepted, active and failed
//! - Bytes and chunks forwarded per direction
//! - Injected per-chunk delay

pub mod exporter;
pub mod recorder;

pub use exporter::{start_metrics_server, MetricsConfig, MetricsError};
pub use recorder::init_metrics;
