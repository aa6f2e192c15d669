//! Storage seam for the archive core.
//!
//! This module is the gateway to the two store implementations (EMBP):
//! - [`PgStore`] talks to the partitioned PostgreSQL schema from `schema.rs`
//! - [`MemoryStore`] keeps the same layout in memory for tests and scratch use
//!
//! Callers depend on the traits only. Every mutating call runs as one
//! transaction: it either applies completely or leaves the store unchanged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{NaturalKey, Point, RawPoint, Record, RecordHeader, RecordId};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// One record write queued by a batch flush.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// `Some` for records that already exist in the store.
    pub id: Option<RecordId>,
    pub key: NaturalKey,
    pub created_on: DateTime<Utc>,
    /// Cadence-unique points to write. Stored cadences not listed here are
    /// kept unless `replace` is set.
    pub points: Vec<Point>,
    /// Drop every stored point of the record before writing `points`.
    pub replace: bool,
}

impl From<&Record> for PendingWrite {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id,
            key: record.key.clone(),
            created_on: record.created_on,
            points: record.lightcurve.points().to_vec(),
            replace: false,
        }
    }
}

/// What a batch write did with one [`PendingWrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersistAction {
    /// New record row created.
    Inserted,
    /// Existing record (by id) had its points upserted by cadence.
    Updated,
    /// New record collided with a stored natural key and was merged into it.
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Persisted {
    pub id: RecordId,
    pub action: PersistAction,
}

/// Point-level reads and writes, routed by partition.
#[async_trait]
pub trait PointStore: Send + Sync {
    /// Cadence-deduplicated, cadence-ascending points of one record. An
    /// unknown id yields an empty series.
    async fn get_points_by_record_id(&self, id: RecordId) -> Result<Vec<Point>>;

    /// Resolve the natural key to exactly one record, then read its points.
    async fn get_points_by_natural_key(&self, key: &NaturalKey) -> Result<Vec<Point>>;

    /// Distinct cadence count of every record of a host.
    async fn get_record_lengths(&self, host_id: i64) -> Result<BTreeMap<RecordId, usize>>;

    /// Every raw row physically stored in the partition holding `id`,
    /// unfiltered by record. Maintenance use only.
    async fn dump_partition(&self, id: RecordId) -> Result<Vec<RawPoint>>;

    /// Append raw rows without deduplication. Later rows win at read time.
    async fn append_points(&self, id: RecordId, points: &[Point]) -> Result<usize>;

    /// Merge batches into the stored series in one transaction. Incoming
    /// cadences overwrite stored ones. Returns the merged series length.
    async fn merge_points(&self, id: RecordId, batches: &[Vec<Point>]) -> Result<usize>;
}

/// Record-level resolution and batch persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Surrogate id for a natural key.
    async fn resolve_id(&self, key: &NaturalKey) -> Result<RecordId>;

    /// A stored record with its deduplicated points.
    async fn get_record(&self, id: RecordId) -> Result<Record>;

    /// Every stored record of a host, ascending by id.
    async fn records_for_host(&self, host_id: i64) -> Result<Vec<Record>>;

    /// Persist a batch atomically. With `resolve_conflicts`, a new record
    /// whose natural key already exists is merged into the stored record;
    /// without it the batch fails with `ConstraintViolation`. The result is
    /// aligned with `batch`.
    async fn persist(&self, batch: &[PendingWrite], resolve_conflicts: bool)
        -> Result<Vec<Persisted>>;

    /// Delete a record with its points and lineage edges.
    async fn delete_record(&self, id: RecordId) -> Result<()>;
}

/// Provenance edges between stored records.
#[async_trait]
pub trait LineageStore: Send + Sync {
    async fn link(&self, source: RecordId, derived: RecordId) -> Result<()>;

    /// Idempotent: removing a missing edge is not an error.
    async fn unlink(&self, source: RecordId, derived: RecordId) -> Result<()>;

    async fn sources_of(&self, id: RecordId) -> Result<Vec<RecordHeader>>;

    async fn derived_from(&self, id: RecordId) -> Result<Vec<RecordHeader>>;
}

/// Everything the archive core needs from a backing store.
pub trait Store: PointStore + RecordStore + LineageStore {}

impl<T> Store for T where T: PointStore + RecordStore + LineageStore {}
