//! Timeline Service
//!
//! Server side of the timeline replay platform:
//! - Multi-tier cache (hot, distributed, snapshot archive, system of record)
//! - Hour-bucketed compressed snapshot archival
//! - Live-update fan-out with bounded subscriber queues
//! - Query/Ingest REST + WebSocket API

pub mod api;
pub mod cache;
pub mod config;
pub mod fanout;
pub mod record;
pub mod service;
pub mod snapshot;

pub use cache::{DistributedCache, SharedCache};
pub use config::ServiceConfig;
pub use fanout::{LiveEvent, LiveUpdateFanOut, LiveUpdateStream, SubscriptionFilter};
pub use record::{InMemoryRecordStore, SystemOfRecord};
pub use service::{TierStatsSnapshot, TimelineService};
pub use snapshot::{SnapshotMetadata, SnapshotStats, SnapshotStore};
