//! Timeline service configuration

use serde::Deserialize;
use std::env;

use tempo_core::{Result, TempoError, TimelineConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub http_port: u16,
    pub log_level: String,
    pub snapshot_dir: String,
    pub timeline: TimelineConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "timeline-service".to_string()),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|e| TempoError::Config(format!("Invalid HTTP_PORT: {}", e)))?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            snapshot_dir: env::var("TEMPO_SNAPSHOT_DIR")
                .unwrap_or_else(|_| "/var/lib/tempo/snapshots".to_string()),
            timeline: TimelineConfig::from_env()?,
        })
    }
}
