//! Tempo Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Timeline domain types (entries, queries, tiers, live updates)
//! - Error handling utilities
//! - Configuration management
//! - Injectable clock for deterministic time in tests
//! - The bounded TTL hot cache used by both client and server tiers
//! - Standard service trait and runtime bootstrap

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod hot;
pub mod merge;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TimelineConfig;
pub use domain::*;
pub use error::{Result, TempoError};
pub use hot::HotCache;
pub use merge::merge_entries;
pub use service::{DependencyStatus, HealthStatus, ReadinessStatus, ServiceRuntime, TempoService};
