//! Interval bookkeeping for locally cached time ranges
//!
//! The loader asks "which parts of this window are still missing" rather
//! than refetching whole windows; this map answers that from merged
//! half-open `[start, end)` spans.

use std::collections::BTreeMap;

/// Set of non-overlapping, non-adjacent half-open millisecond spans.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    /// start -> end, disjoint and sorted by construction.
    spans: BTreeMap<i64, i64>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `[start, end)` as covered, merging into any overlapping or
    /// adjacent spans.
    pub fn insert(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // Absorb every span that overlaps or touches the new one.
        let absorbed: Vec<i64> = self
            .spans
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.spans.remove(&s) {
                new_start = new_start.min(s);
                new_end = new_end.max(e);
            }
        }
        self.spans.insert(new_start, new_end);
    }

    /// Remove `[start, end)` from coverage, splitting spans that straddle
    /// the boundary.
    pub fn remove(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        let affected: Vec<(i64, i64)> = self
            .spans
            .range(..end)
            .filter(|(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in affected {
            self.spans.remove(&s);
            if s < start {
                self.spans.insert(s, start);
            }
            if e > end {
                self.spans.insert(end, e);
            }
        }
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    /// True when `[start, end)` lies entirely inside one covered span.
    pub fn covers(&self, start: i64, end: i64) -> bool {
        if start >= end {
            return true;
        }
        self.spans
            .range(..=start)
            .next_back()
            .map(|(_, &e)| e >= end)
            .unwrap_or(false)
    }

    /// The sub-ranges of `[start, end)` not currently covered, in ascending
    /// order.
    pub fn gaps(&self, start: i64, end: i64) -> Vec<(i64, i64)> {
        let mut gaps = Vec::new();
        let mut cursor = start;

        for (&s, &e) in self.spans.range(..end) {
            if e <= cursor {
                continue;
            }
            if s > cursor {
                gaps.push((cursor, s.min(end)));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    pub fn covered_ms(&self) -> i64 {
        self.spans.iter().map(|(s, e)| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_overlapping_and_adjacent_spans() {
        let mut map = CoverageMap::new();
        map.insert(0, 100);
        map.insert(100, 200);
        map.insert(150, 300);
        assert!(map.covers(0, 300));
        assert_eq!(map.covered_ms(), 300);
    }

    #[test]
    fn gaps_between_disjoint_spans() {
        let mut map = CoverageMap::new();
        map.insert(100, 200);
        map.insert(400, 500);

        assert_eq!(map.gaps(0, 600), vec![(0, 100), (200, 400), (500, 600)]);
        assert_eq!(map.gaps(150, 450), vec![(200, 400)]);
        assert!(map.gaps(120, 180).is_empty());
    }

    #[test]
    fn covers_requires_a_single_span() {
        let mut map = CoverageMap::new();
        map.insert(0, 100);
        map.insert(200, 300);
        assert!(map.covers(10, 90));
        assert!(!map.covers(50, 250));
    }

    #[test]
    fn remove_splits_straddling_spans() {
        let mut map = CoverageMap::new();
        map.insert(0, 1000);
        map.remove(200, 800);

        assert!(map.covers(0, 200));
        assert!(map.covers(800, 1000));
        assert!(!map.covers(199, 201));
        assert_eq!(map.gaps(0, 1000), vec![(200, 800)]);
    }

    #[test]
    fn empty_and_inverted_ranges_are_noops() {
        let mut map = CoverageMap::new();
        map.insert(10, 10);
        map.insert(20, 5);
        assert!(map.is_empty());
        assert!(map.covers(5, 5));
    }
}
