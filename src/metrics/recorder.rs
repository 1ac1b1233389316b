//! Metrics recorder for relay operations
//!
//! Records connection and forwarding activity. Every metric carries a `relay`
//! label holding the relay's listen address. Without an installed recorder
//! these calls are no-ops.

use crate::relay::Direction;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    // Connection counters
    describe_counter!(
        "netjitter_connections_accepted_total",
        "Total number of client connections accepted"
    );
    describe_counter!(
        "netjitter_connect_failures_total",
        "Total number of failed connections to the target"
    );

    // Forwarding counters
    describe_counter!(
        "netjitter_bytes_forwarded_total",
        "Total bytes forwarded, by direction"
    );
    describe_counter!(
        "netjitter_chunks_forwarded_total",
        "Total chunks forwarded, by direction"
    );

    // Gauges
    describe_gauge!(
        "netjitter_connections_active",
        "Number of currently relayed connections"
    );

    // Histograms
    describe_histogram!(
        "netjitter_chunk_delay_seconds",
        "Delay injected after each forwarded chunk"
    );
}

// ============== Connection Operations ==============

/// Record a client being accepted
pub fn record_connection_accepted(relay: &str) {
    counter!("netjitter_connections_accepted_total", "relay" => relay.to_string()).increment(1);
}

/// Record a client connected through to its target
pub fn record_connection_opened(relay: &str) {
    gauge!("netjitter_connections_active", "relay" => relay.to_string()).increment(1.0);
}

/// Record a relayed connection ending
pub fn record_connection_closed(relay: &str) {
    gauge!("netjitter_connections_active", "relay" => relay.to_string()).decrement(1.0);
}

/// Record a failed connection to the target
pub fn record_connect_failure(relay: &str) {
    counter!("netjitter_connect_failures_total", "relay" => relay.to_string()).increment(1);
}

// ============== Forwarding Operations ==============

/// Record one forwarded chunk
pub fn record_chunk_forwarded(relay: &str, direction: Direction, bytes: usize) {
    let direction = direction.as_str();
    counter!(
        "netjitter_chunks_forwarded_total",
        "relay" => relay.to_string(),
        "direction" => direction
    )
    .increment(1);
    counter!(
        "netjitter_bytes_forwarded_total",
        "relay" => relay.to_string(),
        "direction" => direction
    )
    .increment(bytes as u64);
}

/// Record the delay applied after a chunk
pub fn record_chunk_delay(relay: &str, delay: Duration) {
    histogram!("netjitter_chunk_delay_seconds", "relay" => relay.to_string())
        .record(delay.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic when called multiple times
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_connection_accepted("127.0.0.1:9000");
        record_connection_opened("127.0.0.1:9000");
        record_chunk_forwarded("127.0.0.1:9000", Direction::Upstream, 128);
        record_chunk_delay("127.0.0.1:9000", Duration::from_millis(10));
        record_connection_closed("127.0.0.1:9000");
        record_connect_failure("127.0.0.1:9000");
    }
}
