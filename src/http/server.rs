//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;

use super::handler::{configure, enforce_json};
use crate::config::QuotaConfig;
use crate::error::{ArlError, Result};
use crate::ratelimit::RateLimiterBackend;

/// HTTP server for the rate limit accounting API.
pub struct ApiServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<dyn RateLimiterBackend>,
    /// Thresholds used by the quota check
    quota: QuotaConfig,
    /// Time in-flight requests get after the shutdown signal
    shutdown_grace: Duration,
}

impl ApiServer {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        rate_limiter: Arc<dyn RateLimiterBackend>,
        quota: QuotaConfig,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            addr,
            rate_limiter,
            quota,
            shutdown_grace,
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// gives in-flight requests the shutdown grace period to finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let rate_limiter = web::Data::from(self.rate_limiter);
        let quota = web::Data::new(self.quota);

        info!(
            addr = %self.addr,
            shutdown_grace_secs = self.shutdown_grace.as_secs(),
            "Starting HTTP server for rate limit accounting"
        );

        let server = HttpServer::new(move || {
            App::new()
                .app_data(rate_limiter.clone())
                .app_data(quota.clone())
                .wrap(from_fn(enforce_json))
                .wrap(TracingLogger::default())
                .configure(configure)
        })
        .shutdown_timeout(self.shutdown_grace.as_secs())
        .disable_signals()
        .bind(self.addr)
        .map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP server");
            ArlError::Io(e)
        })?
        .run();

        let handle = server.handle();
        tokio::spawn(async move {
            signal.await;
            info!("Stopping HTTP server");
            handle.stop(true).await;
        });

        server.await.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            ArlError::Io(e)
        })
    }
}
