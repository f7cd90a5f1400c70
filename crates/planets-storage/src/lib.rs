//! Planet record store: the store contract plus in-memory and Postgres backends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use planets_core::{BulkWriteResult, KeyFailure, PlanetRecord, UpsertOp, WriteCounts};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "planets-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored record {name}: {reason}")]
    InvalidRecord { name: String, reason: String },
    #[error("store is closed")]
    Closed,
}

/// Result of an explicit creation call. Existing names are never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateResult {
    pub created: Vec<String>,
    pub conflicts: Vec<String>,
    pub failures: Vec<KeyFailure>,
}

/// Document collection of planets keyed by name.
///
/// Every write is atomic per key; batches are not transactional, so a batch
/// may partially succeed and reports per-key failures instead of erroring.
#[async_trait]
pub trait PlanetStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, name: &str) -> Result<Option<PlanetRecord>, StoreError>;

    /// All records ordered by name.
    async fn list(&self) -> Result<Vec<PlanetRecord>, StoreError>;

    /// Create-or-replace-fields by key.
    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError>;

    async fn create(&self, records: &[PlanetRecord]) -> Result<CreateResult, StoreError>;

    /// Replace fields of existing records only; unknown names match nothing.
    async fn update(&self, records: &[PlanetRecord]) -> Result<BulkWriteResult, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    async fn close(&self) {}
}

fn empty_name_failure(name: &str) -> Option<KeyFailure> {
    if name.trim().is_empty() {
        Some(KeyFailure {
            name: name.to_string(),
            reason: "name must not be empty".to_string(),
        })
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct MemoryPlanetStore {
    planets: RwLock<BTreeMap<String, PlanetRecord>>,
    closed: AtomicBool,
}

impl MemoryPlanetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = PlanetRecord>) -> Self {
        let planets = records
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect::<BTreeMap<_, _>>();
        Self {
            planets: RwLock::new(planets),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PlanetStore for MemoryPlanetStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, name: &str) -> Result<Option<PlanetRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.planets.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<PlanetRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.planets.read().await.values().cloned().collect())
    }

    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError> {
        self.ensure_open()?;
        let mut planets = self.planets.write().await;
        let mut result = BulkWriteResult::default();
        for op in ops {
            if let Some(failure) = empty_name_failure(&op.name) {
                result.failures.push(failure);
                continue;
            }
            match planets.get_mut(&op.name) {
                Some(existing) => {
                    result.counts.matched += 1;
                    if existing.fields() != op.fields {
                        *existing = PlanetRecord::new(op.name.clone(), op.fields.clone());
                        result.counts.modified += 1;
                    }
                }
                None => {
                    planets.insert(
                        op.name.clone(),
                        PlanetRecord::new(op.name.clone(), op.fields.clone()),
                    );
                    result.counts.upserted += 1;
                }
            }
        }
        Ok(result)
    }

    async fn create(&self, records: &[PlanetRecord]) -> Result<CreateResult, StoreError> {
        self.ensure_open()?;
        let mut planets = self.planets.write().await;
        let mut result = CreateResult::default();
        for record in records {
            if let Some(failure) = empty_name_failure(&record.name) {
                result.failures.push(failure);
            } else if planets.contains_key(&record.name) {
                result.conflicts.push(record.name.clone());
            } else {
                planets.insert(record.name.clone(), record.clone());
                result.created.push(record.name.clone());
            }
        }
        Ok(result)
    }

    async fn update(&self, records: &[PlanetRecord]) -> Result<BulkWriteResult, StoreError> {
        self.ensure_open()?;
        let mut planets = self.planets.write().await;
        let mut result = BulkWriteResult::default();
        for record in records {
            if let Some(failure) = empty_name_failure(&record.name) {
                result.failures.push(failure);
                continue;
            }
            if let Some(existing) = planets.get_mut(&record.name) {
                result.counts.matched += 1;
                if existing != record {
                    *existing = record.clone();
                    result.counts.modified += 1;
                }
            }
        }
        Ok(result)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.planets.write().await.remove(name).is_some())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres-backed store; schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgPlanetStore {
    pool: PgPool,
}

impl PgPlanetStore {
    pub async fn connect(database_url: &str, config: PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        info!(max_connections = config.max_connections, "connected to planet database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        MIGRATOR.run(&self.pool).await?;
        info!("planet schema migrations applied");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<PlanetRecord, StoreError> {
    let name: String = row.try_get("name")?;
    let reference_count: i32 = row.try_get("reference_count")?;
    let reference_count = u32::try_from(reference_count).map_err(|_| StoreError::InvalidRecord {
        name: name.clone(),
        reason: format!("negative reference_count {reference_count}"),
    })?;
    Ok(PlanetRecord {
        climate: row.try_get("climate")?,
        terrain: row.try_get("terrain")?,
        reference_count,
        name,
    })
}

fn bind_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Errors after which the remaining keys of a batch cannot be attempted.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

/// `inserted` is the `RETURNING (xmax = 0)` flag; no row means the key
/// matched but nothing changed.
fn tally_upsert(counts: &mut WriteCounts, inserted: Option<bool>) {
    match inserted {
        Some(true) => counts.upserted += 1,
        Some(false) => {
            counts.matched += 1;
            counts.modified += 1;
        }
        None => counts.matched += 1,
    }
}

/// Marks every key from `rest` as failed with the same reason.
fn abort_remaining<'a>(
    failures: &mut Vec<KeyFailure>,
    rest: impl Iterator<Item = &'a str>,
    err: &sqlx::Error,
) {
    for name in rest {
        failures.push(KeyFailure {
            name: name.to_string(),
            reason: format!("batch aborted: {err}"),
        });
    }
}

#[async_trait]
impl PlanetStore for PgPlanetStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, name: &str) -> Result<Option<PlanetRecord>, StoreError> {
        self.ensure_open()?;
        let row = sqlx::query(
            r#"
            SELECT name, climate, terrain, reference_count
              FROM planets
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<PlanetRecord>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT name, climate, terrain, reference_count
              FROM planets
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError> {
        self.ensure_open()?;
        let mut result = BulkWriteResult::default();
        for (idx, op) in ops.iter().enumerate() {
            if let Some(failure) = empty_name_failure(&op.name) {
                result.failures.push(failure);
                continue;
            }
            let outcome = sqlx::query(
                r#"
                INSERT INTO planets (name, climate, terrain, reference_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (name) DO UPDATE
                   SET climate = EXCLUDED.climate,
                       terrain = EXCLUDED.terrain,
                       reference_count = EXCLUDED.reference_count,
                       updated_at = NOW()
                 WHERE (planets.climate, planets.terrain, planets.reference_count)
                       IS DISTINCT FROM (EXCLUDED.climate, EXCLUDED.terrain, EXCLUDED.reference_count)
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(&op.name)
            .bind(&op.fields.climate)
            .bind(&op.fields.terrain)
            .bind(bind_count(op.fields.reference_count))
            .fetch_optional(&self.pool)
            .await;

            match outcome.and_then(|row| row.map(|r| r.try_get::<bool, _>("inserted")).transpose()) {
                Ok(inserted) => tally_upsert(&mut result.counts, inserted),
                Err(err) if is_connection_error(&err) => {
                    warn!(key = %op.name, error = %err, "upsert batch aborted on connection error");
                    abort_remaining(
                        &mut result.failures,
                        ops[idx..].iter().map(|o| o.name.as_str()),
                        &err,
                    );
                    break;
                }
                Err(err) => {
                    debug!(key = %op.name, error = %err, "upsert rejected");
                    result.failures.push(KeyFailure {
                        name: op.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    async fn create(&self, records: &[PlanetRecord]) -> Result<CreateResult, StoreError> {
        self.ensure_open()?;
        let mut result = CreateResult::default();
        for record in records {
            if let Some(failure) = empty_name_failure(&record.name) {
                result.failures.push(failure);
                continue;
            }
            let created = sqlx::query(
                r#"
                INSERT INTO planets (name, climate, terrain, reference_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (name) DO NOTHING
                RETURNING name
                "#,
            )
            .bind(&record.name)
            .bind(&record.climate)
            .bind(&record.terrain)
            .bind(bind_count(record.reference_count))
            .fetch_optional(&self.pool)
            .await;

            match created {
                Ok(Some(_)) => result.created.push(record.name.clone()),
                Ok(None) => result.conflicts.push(record.name.clone()),
                Err(err) => result.failures.push(KeyFailure {
                    name: record.name.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn update(&self, records: &[PlanetRecord]) -> Result<BulkWriteResult, StoreError> {
        self.ensure_open()?;
        let mut result = BulkWriteResult::default();
        for record in records {
            if let Some(failure) = empty_name_failure(&record.name) {
                result.failures.push(failure);
                continue;
            }
            let row = sqlx::query(
                r#"
                WITH target AS (
                    SELECT name FROM planets WHERE name = $1
                ), changed AS (
                    UPDATE planets
                       SET climate = $2,
                           terrain = $3,
                           reference_count = $4,
                           updated_at = NOW()
                     WHERE name = $1
                       AND (climate, terrain, reference_count) IS DISTINCT FROM ($2, $3, $4)
                    RETURNING name
                )
                SELECT (SELECT COUNT(*) FROM target) AS matched,
                       (SELECT COUNT(*) FROM changed) AS modified
                "#,
            )
            .bind(&record.name)
            .bind(&record.climate)
            .bind(&record.terrain)
            .bind(bind_count(record.reference_count))
            .fetch_one(&self.pool)
            .await;

            let counted = row.and_then(|row| {
                Ok((row.try_get::<i64, _>("matched")?, row.try_get::<i64, _>("modified")?))
            });
            match counted {
                Ok((matched, modified)) => {
                    result.counts.matched += usize::try_from(matched).unwrap_or(0);
                    result.counts.modified += usize::try_from(modified).unwrap_or(0);
                }
                Err(err) => result.failures.push(KeyFailure {
                    name: record.name.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let done = sqlx::query("DELETE FROM planets WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("planet database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planets_core::PlanetFields;

    fn op(name: &str, climate: &str, terrain: &str, refs: u32) -> UpsertOp {
        UpsertOp {
            name: name.to_string(),
            fields: PlanetFields {
                climate: climate.to_string(),
                terrain: terrain.to_string(),
                reference_count: refs,
            },
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_matches_without_modifying() {
        let store = MemoryPlanetStore::new();
        let ops = vec![op("Tatooine", "arid", "desert", 5), op("Hoth", "frozen", "tundra", 1)];

        let first = store.bulk_upsert(&ops).await.expect("first upsert");
        assert_eq!(first.counts, WriteCounts { matched: 0, modified: 0, upserted: 2 });

        let second = store.bulk_upsert(&ops).await.expect("second upsert");
        assert_eq!(second.counts, WriteCounts { matched: 2, modified: 0, upserted: 0 });
        assert!(second.is_complete());
    }

    #[tokio::test]
    async fn upsert_replaces_changed_fields_only() {
        let store = MemoryPlanetStore::new();
        store
            .bulk_upsert(&[op("Tatooine", "arid", "desert", 5), op("Hoth", "frozen", "tundra", 1)])
            .await
            .expect("seed");

        let result = store
            .bulk_upsert(&[op("Tatooine", "arid", "desert", 6), op("Hoth", "frozen", "tundra", 1)])
            .await
            .expect("upsert");
        assert_eq!(result.counts, WriteCounts { matched: 2, modified: 1, upserted: 0 });

        let tatooine = store.get("Tatooine").await.expect("get").expect("present");
        assert_eq!(tatooine.reference_count, 6);
    }

    #[tokio::test]
    async fn upsert_reports_empty_names_per_key() {
        let store = MemoryPlanetStore::new();
        let result = store
            .bulk_upsert(&[op("  ", "arid", "desert", 0), op("Naboo", "temperate", "swamps", 4)])
            .await
            .expect("upsert");
        assert_eq!(result.counts.upserted, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(store.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn keys_are_case_sensitive() {
        let store = MemoryPlanetStore::new();
        store
            .bulk_upsert(&[op("Kamino", "temperate", "ocean", 1), op("kamino", "temperate", "ocean", 1)])
            .await
            .expect("upsert");
        assert_eq!(store.list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn create_never_overwrites_existing_records() {
        let store = MemoryPlanetStore::with_records([PlanetRecord::new(
            "Endor",
            PlanetFields {
                climate: "temperate".into(),
                terrain: "forests".into(),
                reference_count: 1,
            },
        )]);
        let result = store
            .create(&[
                PlanetRecord::new(
                    "Endor",
                    PlanetFields {
                        climate: "cold".into(),
                        terrain: "ice".into(),
                        reference_count: 9,
                    },
                ),
                PlanetRecord::new(
                    "Bespin",
                    PlanetFields {
                        climate: "temperate".into(),
                        terrain: "gas giant".into(),
                        reference_count: 1,
                    },
                ),
            ])
            .await
            .expect("create");

        assert_eq!(result.created, vec!["Bespin".to_string()]);
        assert_eq!(result.conflicts, vec!["Endor".to_string()]);
        let endor = store.get("Endor").await.expect("get").expect("present");
        assert_eq!(endor.climate, "temperate");
    }

    #[tokio::test]
    async fn update_does_not_create_missing_records() {
        let store = MemoryPlanetStore::new();
        let record = PlanetRecord::new(
            "Dagobah",
            PlanetFields {
                climate: "murky".into(),
                terrain: "swamp".into(),
                reference_count: 3,
            },
        );
        let result = store.update(&[record]).await.expect("update");
        assert_eq!(result.counts, WriteCounts::default());
        assert!(store.get("Dagobah").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_was_removed() {
        let store = MemoryPlanetStore::new();
        store.bulk_upsert(&[op("Alderaan", "temperate", "grasslands", 2)]).await.expect("seed");
        assert!(store.delete("Alderaan").await.expect("delete"));
        assert!(!store.delete("Alderaan").await.expect("second delete"));
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryPlanetStore::new();
        store.close().await;
        assert!(matches!(store.list().await, Err(StoreError::Closed)));
        assert!(matches!(store.bulk_upsert(&[]).await, Err(StoreError::Closed)));
    }

    #[test]
    fn upsert_tally_follows_returning_flag() {
        let mut counts = WriteCounts::default();
        tally_upsert(&mut counts, Some(true));
        tally_upsert(&mut counts, Some(false));
        tally_upsert(&mut counts, None);
        assert_eq!(counts, WriteCounts { matched: 2, modified: 1, upserted: 1 });
    }

    #[test]
    fn oversized_counts_saturate_when_bound() {
        assert_eq!(bind_count(7), 7);
        assert_eq!(bind_count(u32::MAX), i32::MAX);
    }

    #[tokio::test]
    async fn closed_postgres_pool_reports_closed_for_every_operation() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://planets@127.0.0.1:1/planets")
            .expect("lazy pool");
        let store = PgPlanetStore::from_pool(pool);
        store.close().await;

        assert!(matches!(store.get("Tatooine").await, Err(StoreError::Closed)));
        assert!(matches!(store.list().await, Err(StoreError::Closed)));
        assert!(matches!(store.delete("Tatooine").await, Err(StoreError::Closed)));
        assert!(matches!(
            store.bulk_upsert(&[op("Tatooine", "arid", "desert", 5)]).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.migrate().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres database"]
    async fn postgres_upsert_is_idempotent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgPlanetStore::connect(&url, PgStoreConfig::default()).await.expect("connect");
        store.migrate().await.expect("migrate");
        let ops = vec![op("Test-Tatooine", "arid", "desert", 2)];

        store.bulk_upsert(&ops).await.expect("first upsert");
        let second = store.bulk_upsert(&ops).await.expect("second upsert");
        assert_eq!(second.counts, WriteCounts { matched: 1, modified: 0, upserted: 0 });

        assert!(store.delete("Test-Tatooine").await.expect("cleanup"));
        store.close().await;
    }
}
