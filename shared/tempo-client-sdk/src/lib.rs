//! Timeline client SDK
//!
//! Client-side tiers for time-scrubbing frontends:
//! - In-process hot cache over a persistent SQLite cache
//! - Remote timeline-service API as the final client tier
//! - Scrub-aware window loader with debounce and chunked prefetch
//! - Live update feed that keeps the local tiers current

mod coverage;
mod live;
mod loader;
mod manager;
mod persistent;
mod remote;

pub use coverage::CoverageMap;
pub use live::{LiveFeed, ServerEvent};
pub use loader::{LoadOutcome, LoaderStats, TimeWindowLoader};
pub use manager::{CacheManager, ClientQueryResult, ClientStats};
pub use persistent::{PersistentCache, PersistentStats};
pub use remote::{HttpRemoteApi, RemoteApi};

/// Re-export for convenience
pub mod prelude {
    pub use super::{
        CacheManager, ClientQueryResult, HttpRemoteApi, LiveFeed, PersistentCache, RemoteApi,
        TimeWindowLoader,
    };
    pub use tempo_core::{
        DataSource, EntityType, Result, TempoError, Tier, TimeRangeQuery, TimelineConfig,
        TimelineEntry,
    };
}
