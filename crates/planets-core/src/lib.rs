//! Core domain model shared by the catalog, store and sync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "planets-core";

/// Persisted planet, keyed by its case-sensitive `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanetRecord {
    pub name: String,
    pub climate: String,
    pub terrain: String,
    #[serde(default)]
    pub reference_count: u32,
}

impl PlanetRecord {
    pub fn new(name: impl Into<String>, fields: PlanetFields) -> Self {
        Self {
            name: name.into(),
            climate: fields.climate,
            terrain: fields.terrain,
            reference_count: fields.reference_count,
        }
    }

    pub fn fields(&self) -> PlanetFields {
        PlanetFields {
            climate: self.climate.clone(),
            terrain: self.terrain.clone(),
            reference_count: self.reference_count,
        }
    }
}

/// Non-key attributes written by an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanetFields {
    pub climate: String,
    pub terrain: String,
    pub reference_count: u32,
}

/// Catalog-side planet as handed over by a catalog client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub name: String,
    pub climate: String,
    pub terrain: String,
    /// References to associated works (film URLs for SWAPI).
    pub works: Vec<String>,
}

/// Create-or-replace-fields write for a single natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOp {
    pub name: String,
    pub fields: PlanetFields,
}

/// Per-key rejection reported by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteCounts {
    /// Existing records matched by key.
    pub matched: usize,
    /// Matched records whose fields actually changed.
    pub modified: usize,
    /// Records created because no key matched.
    pub upserted: usize,
}

/// Outcome of a batch write. The batch is not transactional; keys that
/// failed are listed in `failures` and are absent from `counts`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkWriteResult {
    pub counts: WriteCounts,
    pub failures: Vec<KeyFailure>,
}

impl BulkWriteResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of one successful fetch-reconcile-upsert cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub matched: usize,
    pub modified: usize,
    pub upserted: usize,
    /// The catalog returned no records for this cycle.
    pub empty_upstream: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_fields() {
        let fields = PlanetFields {
            climate: "arid".into(),
            terrain: "desert".into(),
            reference_count: 5,
        };
        let record = PlanetRecord::new("Tatooine", fields.clone());
        assert_eq!(record.name, "Tatooine");
        assert_eq!(record.fields(), fields);
    }

    #[test]
    fn reference_count_defaults_when_missing_from_json() {
        let record: PlanetRecord =
            serde_json::from_str(r#"{"name":"Hoth","climate":"frozen","terrain":"tundra"}"#)
                .expect("decode");
        assert_eq!(record.reference_count, 0);
    }
}
