//! Relay orchestration
//!
//! Starts a group of relays together and stops them as a group when the
//! shutdown token is cancelled.

pub mod error;
pub mod orchestrator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::RelayOrchestrator;
