//! netjitter: a TCP relay that emulates network latency
//!
//! Each relay listens on one address, connects every accepted client to a
//! fixed target and forwards bytes in both directions in bounded chunks,
//! pausing after each chunk for a delay drawn from a statistical
//! distribution.
//!
//! ```no_run
//! use netjitter::distribution::Distribution;
//! use netjitter::relay::{DelayPolicy, DuplexRelay, RelayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let delay = DelayPolicy::shared(Distribution::gaussian(0.05, 0.01, true)?);
//! let config = RelayConfig::new(
//!     "127.0.0.1:9000".parse()?,
//!     "127.0.0.1:8080".parse()?,
//!     4096,
//!     delay,
//! )?;
//!
//! let relay = DuplexRelay::new(config);
//! relay.start().await?;
//! // ...
//! relay.stop();
//! relay.join().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod distribution;
pub mod metrics;
pub mod orchestrator;
pub mod relay;

pub use distribution::{DelayModel, Distribution, DistributionError};
pub use orchestrator::{OrchestratorError, RelayOrchestrator};
pub use relay::{DelayPolicy, DuplexRelay, RelayConfig, RelayError, RelayEvent};
