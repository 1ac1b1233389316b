use crate::relay::RelayError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{} of {} relays failed to start", .failures.len(), .failures.len() + .started.len())]
    StartFailed {
        /// Addresses of the relays that did start and are still running
        started: Vec<SocketAddr>,
        /// Configured listen address and error of each relay that did not
        failures: Vec<(SocketAddr, RelayError)>,
    },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
