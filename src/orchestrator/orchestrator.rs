use crate::orchestrator::error::{OrchestratorError, OrchestratorResult};
use crate::relay::DuplexRelay;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs a group of relays with a shared lifecycle
///
/// The orchestrator does not look inside its relays; it starts them, stops
/// them and waits for them. Shutdown is requested by cancelling
/// [`shutdown_token`](Self::shutdown_token), typically from a signal handler
/// owned by the caller.
pub struct RelayOrchestrator {
    relays: Vec<Arc<DuplexRelay>>,
    shutdown: CancellationToken,
}

impl Default for RelayOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayOrchestrator {
    pub fn new() -> Self {
        Self {
            relays: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a relay before startup
    pub fn add(&mut self, relay: DuplexRelay) -> Arc<DuplexRelay> {
        let relay = Arc::new(relay);
        self.relays.push(Arc::clone(&relay));
        relay
    }

    pub fn relays(&self) -> &[Arc<DuplexRelay>] {
        &self.relays
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Start every relay
    ///
    /// A relay that fails to bind does not prevent the others from starting.
    /// If any failed, the error lists them alongside the relays that are
    /// now running.
    pub async fn start_all(&self) -> OrchestratorResult<Vec<SocketAddr>> {
        let results = join_all(self.relays.iter().map(|relay| relay.start())).await;

        let mut started = Vec::new();
        let mut failures = Vec::new();
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(addr) => started.push(addr),
                Err(e) => {
                    let listen_addr = relay.config().listen_addr;
                    tracing::error!(relay = %listen_addr, error = %e, "Relay failed to start");
                    failures.push((listen_addr, e));
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(relays = started.len(), "All relays started");
            Ok(started)
        } else {
            Err(OrchestratorError::StartFailed { started, failures })
        }
    }

    /// Stop every relay without waiting for them
    pub fn stop_all(&self) {
        for relay in &self.relays {
            relay.stop();
        }
    }

    /// Wait for every relay's tasks to exit
    pub async fn join_all(&self) {
        join_all(self.relays.iter().map(|relay| relay.join())).await;
    }

    /// Token that, once cancelled, makes
    /// [`await_termination`](Self::await_termination) stop all relays
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Block until shutdown is requested, then stop and join every relay
    pub async fn await_termination(&self) {
        self.shutdown.cancelled().await;
        tracing::info!(relays = self.relays.len(), "Shutdown requested, stopping relays");

        self.stop_all();
        self.join_all().await;
        tracing::info!("All relays stopped");
    }
}
