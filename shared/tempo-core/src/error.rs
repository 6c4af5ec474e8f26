//! Error types for tempo services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TempoError>;

#[derive(Error, Debug)]
pub enum TempoError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A non-final cache tier failed or timed out. Absorbed by falling
    /// through to the next tier; never surfaced on its own.
    #[error("Tier unavailable ({tier}): {reason}")]
    TierUnavailable { tier: &'static str, reason: String },

    /// The system of record failed, or the data is genuinely absent.
    /// Terminal: surfaced distinctly from empty-but-complete results.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// The live fan-out dropped messages for this subscriber; the affected
    /// window must be re-queried rather than trusting a gapped stream.
    #[error("Resync required: {dropped} live updates dropped")]
    ResyncRequired { dropped: u64 },

    /// A cache exceeded its capacity. Self-healing via eviction.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TempoError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidQuery(_) => 400,
            Self::ResyncRequired { .. } => 409,
            Self::TierUnavailable { .. } => 503,
            Self::DataUnavailable(_) => 503,
            Self::Network(_) => 502,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::TierUnavailable { .. } => "TIER_UNAVAILABLE",
            Self::DataUnavailable(_) => "DATA_UNAVAILABLE",
            Self::ResyncRequired { .. } => "RESYNC_REQUIRED",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for TempoError {
    fn from(err: std::io::Error) -> Self {
        TempoError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TempoError {
    fn from(err: serde_json::Error) -> Self {
        TempoError::Serialization(err.to_string())
    }
}
