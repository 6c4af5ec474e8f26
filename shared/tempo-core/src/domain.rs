//! Core timeline domain types

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TempoError};

/// Kind of tracked entity. Known kinds get fixed names on the wire; anything
/// else round-trips through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Aircraft,
    Vessel,
    Satellite,
    Wildlife,
    Earthquake,
    Storm,
    Wildfire,
    Sensor,
    Forecast,
    Custom(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Aircraft => "aircraft",
            Self::Vessel => "vessel",
            Self::Satellite => "satellite",
            Self::Wildlife => "wildlife",
            Self::Earthquake => "earthquake",
            Self::Storm => "storm",
            Self::Wildfire => "wildfire",
            Self::Sensor => "sensor",
            Self::Forecast => "forecast",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "aircraft" => Self::Aircraft,
            "vessel" => Self::Vessel,
            "satellite" => Self::Satellite,
            "wildlife" => Self::Wildlife,
            "earthquake" => Self::Earthquake,
            "storm" => Self::Storm,
            "wildfire" => Self::Wildfire,
            "sensor" => Self::Sensor,
            "forecast" => Self::Forecast,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EntityType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EntityType::parse(&s))
    }
}

/// Provenance of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Historical,
    Forecast,
    Cached,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Historical => "historical",
            Self::Forecast => "forecast",
            Self::Cached => "cached",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "historical" => Self::Historical,
            "forecast" => Self::Forecast,
            "cached" => Self::Cached,
            _ => Self::Live,
        }
    }
}

impl Default for DataSource {
    fn default() -> Self {
        Self::Live
    }
}

/// One layer of the cache hierarchy, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ClientHot,
    Persistent,
    Remote,
    Hot,
    Distributed,
    Snapshot,
    SystemOfRecord,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientHot => "client_hot",
            Self::Persistent => "persistent",
            Self::Remote => "remote",
            Self::Hot => "hot",
            Self::Distributed => "distributed",
            Self::Snapshot => "snapshot",
            Self::SystemOfRecord => "system_of_record",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Composite key identifying a timeline entry across every tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub timestamp: i64,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeline:{}:{}:{}",
            self.entity_type, self.entity_id, self.timestamp
        )
    }
}

/// A single data point in a timeline. Immutable once written; a write with
/// the same composite key is an idempotent last-write-wins upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Opaque per-entity-type payload; always a JSON object.
    pub data: serde_json::Value,
    #[serde(default)]
    pub source: DataSource,
    /// Domain-level expiry in ms; 0 means no expiry.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub approx_size_bytes: u64,
    #[serde(default)]
    pub last_accessed_at: i64,
}

impl TimelineEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        timestamp: i64,
        data: serde_json::Value,
    ) -> Self {
        let mut entry = Self {
            entity_type,
            entity_id: entity_id.into(),
            timestamp,
            data,
            source: DataSource::Live,
            expires_at: 0,
            approx_size_bytes: 0,
            last_accessed_at: 0,
        };
        entry.approx_size_bytes = entry.estimate_size();
        entry
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at > 0 && now_ms >= self.expires_at
    }

    /// Rough serialized footprint, used for size-bounded eviction.
    pub fn estimate_size(&self) -> u64 {
        let payload = serde_json::to_string(&self.data)
            .map(|s| s.len())
            .unwrap_or(0);
        (payload + self.entity_id.len() + self.entity_type.as_str().len() + 64) as u64
    }
}

/// Query parameters for a timeline range lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRangeQuery {
    pub entity_type: EntityType,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TimeRangeQuery {
    pub fn range(entity_type: EntityType, start_time: i64, end_time: i64) -> Self {
        Self {
            entity_type,
            start_time,
            end_time,
            entity_id: None,
            limit: None,
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rejects malformed queries locally, before any tier is touched.
    pub fn validate(&self) -> Result<()> {
        if self.start_time > self.end_time {
            return Err(TempoError::InvalidQuery(format!(
                "start_time {} is after end_time {}",
                self.start_time, self.end_time
            )));
        }
        if self.entity_type.as_str().is_empty() {
            return Err(TempoError::InvalidQuery(
                "entity_type must not be empty".to_string(),
            ));
        }
        if let Some(id) = &self.entity_id {
            if id.is_empty() {
                return Err(TempoError::InvalidQuery(
                    "entity_id must not be empty when present".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Canonical key used to coalesce concurrent identical queries.
    pub fn normalized_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.entity_type,
            self.entity_id.as_deref().unwrap_or("*"),
            self.start_time,
            self.end_time,
            self.limit.unwrap_or(0)
        )
    }

    pub fn matches(&self, entry: &TimelineEntry) -> bool {
        if entry.entity_type != self.entity_type {
            return false;
        }
        if let Some(id) = &self.entity_id {
            if &entry.entity_id != id {
                return false;
            }
        }
        entry.timestamp >= self.start_time && entry.timestamp <= self.end_time
    }
}

/// Result of a tiered lookup: merged entries plus which tier answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResult {
    pub entries: Vec<TimelineEntry>,
    pub answering_tier: Tier,
    /// True when some tier failed and the result may be incomplete.
    pub partial: bool,
    pub latency_ms: f64,
}

/// Message broadcast to live subscribers on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdateMessage {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl LiveUpdateMessage {
    pub fn from_entry(entry: &TimelineEntry) -> Self {
        Self {
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            timestamp: entry.timestamp,
            data: entry.data.clone(),
        }
    }

    pub fn into_entry(self) -> TimelineEntry {
        TimelineEntry::new(self.entity_type, self.entity_id, self.timestamp, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_round_trip() {
        let known = EntityType::parse("aircraft");
        assert_eq!(known, EntityType::Aircraft);
        assert_eq!(known.as_str(), "aircraft");

        let custom = EntityType::parse("buoy");
        assert_eq!(custom, EntityType::Custom("buoy".to_string()));

        let json = serde_json::to_string(&custom).unwrap();
        assert_eq!(json, "\"buoy\"");
        let back: EntityType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, custom);
    }

    #[test]
    fn query_validation_rejects_inverted_range() {
        let q = TimeRangeQuery::range(EntityType::Aircraft, 2000, 1000);
        let err = q.validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_QUERY");
    }

    #[test]
    fn query_validation_rejects_empty_entity_type() {
        let q = TimeRangeQuery::range(EntityType::Custom(String::new()), 0, 10);
        assert!(q.validate().is_err());
    }

    #[test]
    fn entry_expiry_is_lazy_and_key_stable() {
        let mut entry = TimelineEntry::new(
            EntityType::Aircraft,
            "N123",
            1000,
            json!({"lat": 10, "lon": 20}),
        );
        assert!(!entry.is_expired(5000));
        entry.expires_at = 4000;
        assert!(entry.is_expired(4000));
        assert_eq!(entry.key().to_string(), "timeline:aircraft:N123:1000");
    }

    #[test]
    fn normalized_key_distinguishes_entity_scope() {
        let a = TimeRangeQuery::range(EntityType::Vessel, 0, 100);
        let b = TimeRangeQuery::range(EntityType::Vessel, 0, 100).for_entity("V1");
        assert_ne!(a.normalized_key(), b.normalized_key());
    }
}
