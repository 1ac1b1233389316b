//! Duplex relay module
//!
//! Accepts TCP clients, connects each one to a fixed target and forwards bytes
//! both ways in bounded chunks, waiting a sampled delay after every chunk.
//!
//! Key features:
//! - One accept task plus two pump tasks per connection
//! - Shared or per-direction delay models
//! - Cancellable reads, writes and delays for prompt shutdown
//! - Statistics snapshot and an event channel for observers

pub mod duplex;
pub mod pump;
pub mod types;

pub use duplex::DuplexRelay;
pub use pump::ConnectionEntry;
pub use types::{
    event_channel, CloseReason, ConnectionId, DelayPolicy, Direction, RelayConfig, RelayError,
    RelayEvent, RelayResult, RelayState, RelayStats, ACCEPT_ERROR_BACKOFF, CONNECT_TIMEOUT,
    DEFAULT_CHUNK_SIZE, DEFAULT_EVENT_CAPACITY, LISTEN_BACKLOG, MAX_ACCEPT_ERROR_BACKOFF,
    MAX_CHUNK_SIZE,
};
