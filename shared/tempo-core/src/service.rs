//! Service infrastructure shared by tempo services

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::error::Result;

/// Health status for liveness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness status for readiness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Standard trait all tempo services implement
#[async_trait]
pub trait TempoService: Send + Sync + 'static {
    /// Service identifier (e.g., "timeline-service")
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Health check - is the service alive?
    async fn health(&self) -> HealthStatus;

    /// Readiness check - are all tiers/dependencies available?
    async fn ready(&self) -> ReadinessStatus;

    /// Graceful shutdown: stop background tasks, flush open state.
    async fn shutdown(&self) -> Result<()>;

    /// Start the service (HTTP server, background tasks).
    async fn start(&self) -> Result<()>;
}

/// Standard service lifecycle bootstrap
pub struct ServiceRuntime;

impl ServiceRuntime {
    /// Run a service with signal-driven graceful shutdown.
    pub async fn run<S: TempoService>(service: Arc<S>) -> Result<()> {
        let start_time = std::time::Instant::now();

        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting service"
        );

        let service_clone = service.clone();
        let service_handle = tokio::spawn(async move {
            if let Err(e) = service_clone.start().await {
                tracing::error!("Service error: {}", e);
            }
        });

        Self::wait_for_shutdown().await;

        info!("Shutdown signal received, gracefully stopping...");

        if let Err(e) = service.shutdown().await {
            warn!("Error during shutdown: {}", e);
        }

        service_handle.abort();

        info!(
            uptime_seconds = start_time.elapsed().as_secs(),
            "Service stopped"
        );

        Ok(())
    }

    async fn wait_for_shutdown() {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to listen for SIGTERM")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}
