//! Multi-tier result merging

use std::collections::HashSet;

use crate::domain::{EntryKey, TimelineEntry};

/// Merge entry batches from successive tiers, fastest tier first.
///
/// Deduplicates by composite key (the earlier, faster tier wins), sorts
/// timestamp-ascending with entity id as tiebreaker, and applies the limit.
pub fn merge_entries(
    batches: Vec<Vec<TimelineEntry>>,
    limit: Option<usize>,
) -> Vec<TimelineEntry> {
    let mut seen: HashSet<EntryKey> = HashSet::new();
    let mut merged: Vec<TimelineEntry> = Vec::new();

    for batch in batches {
        for entry in batch {
            if seen.insert(entry.key()) {
                merged.push(entry);
            }
        }
    }

    merged.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
            .then_with(|| a.entity_type.cmp(&b.entity_type))
    });

    if let Some(limit) = limit {
        merged.truncate(limit);
    }
    merged
}
