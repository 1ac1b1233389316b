//! Relay types and configuration

use crate::distribution::DelayModel;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bytes read from a socket per chunk unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest accepted `chunk_size`; every pump allocates one buffer of this size
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the event channel created by [`event_channel`]
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Pending-connection backlog of the listening socket
pub const LISTEN_BACKLOG: i32 = 1024;

/// Pause after the first failed `accept()`; doubles on each further failure
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Ceiling for the accept back-off
pub const MAX_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on establishing the outbound connection for one client
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay-specific errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay on {0} is already started")]
    AlreadyStarted(SocketAddr),

    #[error("Relay on {0} has been stopped")]
    Stopped(SocketAddr),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ConnectionId = u64;

/// Which way bytes flow through a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to target
    Upstream,
    /// Target to client
    Downstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which delay model each direction of a connection samples from
#[derive(Debug, Clone)]
pub enum DelayPolicy {
    /// One model for both directions
    Shared(Arc<dyn DelayModel>),

    /// Independent models per direction
    PerDirection {
        upstream: Arc<dyn DelayModel>,
        downstream: Arc<dyn DelayModel>,
    },
}

impl DelayPolicy {
    pub fn shared(model: impl DelayModel + 'static) -> Self {
        DelayPolicy::Shared(Arc::new(model))
    }

    pub fn per_direction(
        upstream: impl DelayModel + 'static,
        downstream: impl DelayModel + 'static,
    ) -> Self {
        DelayPolicy::PerDirection {
            upstream: Arc::new(upstream),
            downstream: Arc::new(downstream),
        }
    }

    pub fn for_direction(&self, direction: Direction) -> Arc<dyn DelayModel> {
        match (self, direction) {
            (DelayPolicy::Shared(model), _) => Arc::clone(model),
            (DelayPolicy::PerDirection { upstream, .. }, Direction::Upstream) => {
                Arc::clone(upstream)
            }
            (DelayPolicy::PerDirection { downstream, .. }, Direction::Downstream) => {
                Arc::clone(downstream)
            }
        }
    }
}

impl fmt::Display for DelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayPolicy::Shared(model) => write!(f, "{model}"),
            DelayPolicy::PerDirection {
                upstream,
                downstream,
            } => write!(f, "upstream: {upstream}; downstream: {downstream}"),
        }
    }
}

/// Configuration for a duplex relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to accept clients on
    pub listen_addr: SocketAddr,

    /// Target every accepted client is connected to
    pub connect_addr: SocketAddr,

    /// Maximum bytes read per chunk
    pub chunk_size: usize,

    /// Delay applied after each forwarded chunk
    pub delay: DelayPolicy,
}

impl RelayConfig {
    pub fn new(
        listen_addr: SocketAddr,
        connect_addr: SocketAddr,
        chunk_size: usize,
        delay: DelayPolicy,
    ) -> RelayResult<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(RelayError::InvalidConfig(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {chunk_size}"
            )));
        }

        Ok(Self {
            listen_addr,
            connect_addr,
            chunk_size,
            delay,
        })
    }
}

/// Lifecycle of a relay; `Stopped` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    Listening,
    Stopped,
}

/// Why a relayed connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The side read by the pump in this direction closed its end
    PeerClosed(Direction),

    ReadFailed { direction: Direction, error: String },

    WriteFailed { direction: Direction, error: String },

    /// The relay was stopped
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed(Direction::Upstream) => f.write_str("client closed"),
            CloseReason::PeerClosed(Direction::Downstream) => f.write_str("target closed"),
            CloseReason::ReadFailed { direction, error } => {
                write!(f, "{direction} read failed: {error}")
            }
            CloseReason::WriteFailed { direction, error } => {
                write!(f, "{direction} write failed: {error}")
            }
            CloseReason::Shutdown => f.write_str("relay stopped"),
        }
    }
}

/// Events emitted by a relay
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Listening socket bound
    Listening { addr: SocketAddr },

    /// Client accepted and connected through to the target
    ConnectionOpened {
        conn_id: ConnectionId,
        peer: SocketAddr,
    },

    /// Outbound connection for an accepted client failed; the client was closed
    ConnectFailed {
        peer: SocketAddr,
        target: SocketAddr,
        error: String,
    },

    /// Both pumps of a connection finished
    ConnectionClosed {
        conn_id: ConnectionId,
        peer: SocketAddr,
        reason: CloseReason,
        bytes_upstream: u64,
        bytes_downstream: u64,
    },

    /// The listening socket broke; the relay no longer accepts clients but
    /// existing connections keep running until `stop()`
    ListenerFailed { addr: SocketAddr, error: String },

    /// Relay stopped
    Stopped { addr: SocketAddr },
}

/// Bounded channel for [`RelayEvent`]s
pub fn event_channel() -> (mpsc::Sender<RelayEvent>, mpsc::Receiver<RelayEvent>) {
    mpsc::channel(DEFAULT_EVENT_CAPACITY)
}

/// Deliver `event` without waiting; a full channel drops it
pub(crate) fn send_event(tx: Option<&mpsc::Sender<RelayEvent>>, relay: &str, event: RelayEvent) {
    let Some(tx) = tx else {
        return;
    };
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!(relay = %relay, ?event, "Event channel full, dropping event");
        }
        // Observer went away
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Snapshot of relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub connect_failures: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub chunks_upstream: u64,
    pub chunks_downstream: u64,
    pub total_delay: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    pub connections_accepted: AtomicU64,
    pub connect_failures: AtomicU64,
    pub bytes_upstream: AtomicU64,
    pub bytes_downstream: AtomicU64,
    pub chunks_upstream: AtomicU64,
    pub chunks_downstream: AtomicU64,
    pub delay_micros: AtomicU64,
}

impl RelayCounters {
    pub fn record_chunk(&self, direction: Direction, bytes: usize) {
        let (chunks, total) = match direction {
            Direction::Upstream => (&self.chunks_upstream, &self.bytes_upstream),
            Direction::Downstream => (&self.chunks_downstream, &self.bytes_downstream),
        };
        chunks.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.delay_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_connections: usize) -> RelayStats {
        RelayStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: active_connections as u64,
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            chunks_upstream: self.chunks_upstream.load(Ordering::Relaxed),
            chunks_downstream: self.chunks_downstream.load(Ordering::Relaxed),
            total_delay: Duration::from_micros(self.delay_micros.load(Ordering::Relaxed)),
        }
    }
}
