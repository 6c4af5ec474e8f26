//! Server-side cache tiers

mod distributed;

pub use distributed::{DistributedCache, SharedCache};
