//! Timeline Cache Microservice
//!
//! Multi-tier timeline store for time-scrubbing clients:
//! - Hot in-process cache over a shared distributed tier
//! - Hourly gzip snapshot archive with a metadata index
//! - System-of-record fallback, always consulted on a full miss
//! - Live update fan-out over WebSocket with resync-on-overflow

use std::sync::Arc;

use tracing::info;

use tempo_core::{
    DependencyStatus, HealthStatus, ReadinessStatus, Result, ServiceRuntime, SystemClock,
    TempoError, TempoService,
};
use timeline_service::{
    api, InMemoryRecordStore, ServiceConfig, SharedCache, TimelineService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env()?;

    let directive = format!("timeline_service={}", config.log_level)
        .parse()
        .map_err(|e| TempoError::Config(format!("invalid log level: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .json()
        .init();

    info!("Starting Timeline Cache microservice");

    let app = Arc::new(TimelineApp::new(config)?);
    ServiceRuntime::run(app).await
}

pub struct TimelineApp {
    service: Arc<TimelineService>,
    start_time: std::time::Instant,
}

impl TimelineApp {
    /// Wires the default single-host tier implementations. Multi-host
    /// deployments construct `TimelineService` with external distributed
    /// and record backends instead.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let clock = Arc::new(SystemClock);
        let distributed = Arc::new(SharedCache::new(
            config.timeline.distributed_cache_ttl_ms(),
            clock.clone(),
        ));
        let record = Arc::new(InMemoryRecordStore::new());
        let service = Arc::new(TimelineService::new(config, clock, distributed, record)?);

        Ok(Self {
            service,
            start_time: std::time::Instant::now(),
        })
    }
}

#[async_trait::async_trait]
impl TempoService for TimelineApp {
    fn service_id(&self) -> &'static str {
        "timeline-service"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let stats = self.service.stats().await;
        ReadinessStatus {
            ready: stats.record_healthy,
            dependencies: vec![
                DependencyStatus {
                    name: "distributed-cache".to_string(),
                    available: stats.distributed_healthy,
                    latency_ms: None,
                },
                DependencyStatus {
                    name: "system-of-record".to_string(),
                    available: stats.record_healthy,
                    latency_ms: None,
                },
            ],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Timeline Cache service");
        self.service.stop_background_tasks();
        let sealed = self.service.snapshots().seal_all()?;
        info!(sealed, "Flushed open snapshot buckets");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.service.start_background_tasks();

        let bind = format!("0.0.0.0:{}", self.service.config().http_port);
        info!(http = %bind, "Starting Timeline Cache server");

        let app = api::router(self.service.clone());
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
