//! netjitter binary
//!
//! # Usage
//!
//! ```bash
//! # One relay with a normally distributed delay
//! netjitter gaussian -p 127.0.0.1:9000 127.0.0.1:8080 --mean 0.05 --std-dev 0.01
//!
//! # Every relay in a file, with Prometheus metrics
//! netjitter --metrics-addr 127.0.0.1:9090 config relays.toml
//!
//! # Available distributions and their parameters
//! netjitter distributions
//! ```

mod cli;

use anyhow::Context;
use cli::Invocation;
use netjitter::metrics::{start_metrics_server, MetricsConfig};
use netjitter::orchestrator::{OrchestratorError, RelayOrchestrator};
use netjitter::relay::DuplexRelay;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli::command().get_matches();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli::log_level(&matches)));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let configs = match Invocation::from_matches(&matches)? {
        Invocation::Distributions => {
            print!("{}", cli::catalogue());
            return Ok(());
        }
        Invocation::Config(path) => cli::load_config(&path)?,
        Invocation::Relays(args) => args.relay_configs()?,
    };

    if let Some(addr) = cli::metrics_addr(&matches) {
        start_metrics_server(MetricsConfig::with_addr(addr)).context("metrics exporter")?;
    }

    let mut orchestrator = RelayOrchestrator::new();
    for config in configs {
        tracing::info!(
            listen = %config.listen_addr,
            connect = %config.connect_addr,
            chunk_size = config.chunk_size,
            delay = %config.delay,
            "Configured relay"
        );
        orchestrator.add(DuplexRelay::new(config));
    }

    if let Err(e) = orchestrator.start_all().await {
        let OrchestratorError::StartFailed { started, .. } = &e;
        if started.is_empty() {
            return Err(e.into());
        }
        tracing::warn!(running = started.len(), "{e}; continuing with the relays that started");
    }

    tokio::spawn(forward_shutdown_signal(orchestrator.shutdown_token()));
    tracing::info!("Press Ctrl+C to stop");

    orchestrator.await_termination().await;
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C, or SIGTERM on Unix
async fn forward_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
