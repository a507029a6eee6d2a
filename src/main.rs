use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arl::clock::{Clock, SystemClock};
use arl::config::{ArlConfig, LoggingConfig};
use arl::http::ApiServer;
use arl::ratelimit::RateLimitService;
use arl::store::{DurableCounter, FastCounter};

/// API rate limit accounting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        ArlConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.http_addr = listen;
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting ARL rate limit accounting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (fast, sweeper) =
        FastCounter::spawn(&config.fast_tier, clock.clone(), shutdown.child_token());
    info!("Fast counter initialized");

    let durable = DurableCounter::connect(&config.durable)
        .await
        .context("Failed to connect to Redis")?;
    info!("Durable counter initialized");

    let service = Arc::new(RateLimitService::new(
        fast,
        Arc::new(durable),
        clock,
        &config.service,
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // Every teardown stage draws on one grace period,
    // counted from the moment shutdown begins.
    let grace = config.server.shutdown_grace();
    let deadline = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            Instant::now() + grace
        }
    });

    let server = ApiServer::new(
        config.server.http_addr,
        service.clone(),
        config.quota.clone(),
        grace,
    );
    let stopped = shutdown.clone();
    let served = server
        .serve_with_shutdown(async move { stopped.cancelled().await })
        .await;

    // The server can also exit on its own (e.g. a bind failure).
    shutdown.cancel();
    let deadline = deadline
        .await
        .unwrap_or_else(|_| Instant::now() + grace);
    sweeper.join().await;

    if !service.drain_until(deadline).await {
        warn!(
            pending = service.pending_durable_writes(),
            "Abandoning durable writes still in flight"
        );
    }

    served?;
    info!("ARL rate limit accounting service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
