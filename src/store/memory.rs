//! In-memory store.
//!
//! Raw points are grouped by router partition exactly like the Postgres
//! layout, and reads go through the same cadence deduplication. Each mutating
//! call works on a draft copy of the state under the write lock and swaps it
//! in only on success, which gives all-or-nothing batches.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{LineageStore, PendingWrite, PersistAction, Persisted, PointStore, RecordStore};
use crate::dedup::{dedup_points, distinct_cadence_counts};
use crate::error::{ArchiveError, Result};
use crate::lightcurve::Lightcurve;
use crate::lineage::LineageGraph;
use crate::models::{NaturalKey, Point, RawPoint, Record, RecordHeader, RecordId};
use crate::partition::{PartitionRange, PartitionRouter};

// ---

#[derive(Debug, Clone)]
struct StoredRecord {
    key: NaturalKey,
    created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct State {
    next_record_id: i64,
    next_seq: i64,
    records: BTreeMap<RecordId, StoredRecord>,
    keys: BTreeMap<NaturalKey, RecordId>,
    partitions: BTreeMap<PartitionRange, Vec<RawPoint>>,
    lineage: LineageGraph,
}

impl State {
    fn new(first_id: i64) -> Self {
        Self {
            next_record_id: first_id,
            next_seq: 1,
            records: BTreeMap::new(),
            keys: BTreeMap::new(),
            partitions: BTreeMap::new(),
            lineage: LineageGraph::new(),
        }
    }

    fn ensure_exists(&self, id: RecordId) -> Result<()> {
        if self.records.contains_key(&id) {
            Ok(())
        } else {
            Err(ArchiveError::record_not_found(id))
        }
    }

    fn points(&self, router: &PartitionRouter, id: RecordId) -> Vec<Point> {
        self.partitions
            .get(&router.partition_for(id))
            .map(|rows| dedup_points(id, rows))
            .unwrap_or_default()
    }

    fn append(&mut self, router: &PartitionRouter, id: RecordId, points: &[Point]) {
        // ---
        let rows = self.partitions.entry(router.partition_for(id)).or_default();
        for point in points {
            rows.push(RawPoint {
                seq: self.next_seq,
                record_id: id,
                point: *point,
            });
            self.next_seq += 1;
        }
    }

    /// Drop raw rows of `id`, optionally only those at the given cadences.
    fn remove_rows(&mut self, router: &PartitionRouter, id: RecordId, cadences: Option<&[Point]>) {
        // ---
        let range = router.partition_for(id);
        if let Some(rows) = self.partitions.get_mut(&range) {
            rows.retain(|r| {
                r.record_id != id
                    || cadences.is_some_and(|batch| {
                        !batch.iter().any(|p| p.cadence == r.point.cadence)
                    })
            });
            if rows.is_empty() {
                self.partitions.remove(&range);
            }
        }
    }

    /// Write `write.points` over record `id`: replace everything when the
    /// write asks for it, otherwise only the written cadences.
    fn overwrite(&mut self, router: &PartitionRouter, id: RecordId, write: &PendingWrite) {
        // ---
        let cadences = (!write.replace).then_some(write.points.as_slice());
        self.remove_rows(router, id, cadences);
        self.append(router, id, &write.points);
    }

    fn insert_record(&mut self, key: NaturalKey, created_on: DateTime<Utc>) -> RecordId {
        let id = RecordId(self.next_record_id);
        self.next_record_id += 1;
        self.keys.insert(key.clone(), id);
        self.records.insert(id, StoredRecord { key, created_on });
        id
    }

    fn header(&self, id: RecordId) -> Option<RecordHeader> {
        self.records.get(&id).map(|r| RecordHeader {
            id,
            key: r.key.clone(),
        })
    }

    fn apply(
        &mut self,
        router: &PartitionRouter,
        write: &PendingWrite,
        resolve_conflicts: bool,
    ) -> Result<Persisted> {
        // ---
        if let Some(id) = write.id {
            let stored = self
                .records
                .get(&id)
                .ok_or_else(|| ArchiveError::record_not_found(id))?;
            if stored.key != write.key {
                return Err(ArchiveError::ConstraintViolation(format!(
                    "record {id} is stored as {} but was written as {}",
                    stored.key, write.key
                )));
            }
            self.overwrite(router, id, write);
            return Ok(Persisted {
                id,
                action: PersistAction::Updated,
            });
        }

        match self.keys.get(&write.key).copied() {
            Some(id) if resolve_conflicts => {
                self.overwrite(router, id, write);
                Ok(Persisted {
                    id,
                    action: PersistAction::Merged,
                })
            }
            Some(_) => Err(ArchiveError::ConstraintViolation(format!(
                "duplicate key value violates unique constraint on {}",
                write.key
            ))),
            None => {
                let id = self.insert_record(write.key.clone(), write.created_on);
                self.append(router, id, &write.points);
                Ok(Persisted {
                    id,
                    action: PersistAction::Inserted,
                })
            }
        }
    }
}

/// Thread-safe in-memory implementation of all store traits.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    router: PartitionRouter,
    state: Arc<RwLock<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with the default partition width, assigning ids from 1.
    pub fn new() -> Self {
        Self::with_router(PartitionRouter::default(), 1)
    }

    /// Empty store with a custom router and first surrogate id.
    pub fn with_router(router: PartitionRouter, first_id: i64) -> Self {
        Self {
            router,
            state: Arc::new(RwLock::new(State::new(first_id))),
        }
    }

    pub fn router(&self) -> PartitionRouter {
        self.router
    }

    pub fn record_count(&self) -> usize {
        self.state.read().records.len()
    }

    /// Partitions currently holding at least one row.
    pub fn partitions(&self) -> Vec<PartitionRange> {
        self.state.read().partitions.keys().copied().collect()
    }

    /// Run `f` against a draft of the state and publish it only on success.
    fn transact<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        // ---
        let mut guard = self.state.write();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        *guard = draft;
        Ok(out)
    }
}

#[async_trait]
impl PointStore for MemoryStore {
    async fn get_points_by_record_id(&self, id: RecordId) -> Result<Vec<Point>> {
        debug!("Reading record {} from partition {}", id, self.router.partition_for(id));
        Ok(self.state.read().points(&self.router, id))
    }

    async fn get_points_by_natural_key(&self, key: &NaturalKey) -> Result<Vec<Point>> {
        let id = self.resolve_id(key).await?;
        self.get_points_by_record_id(id).await
    }

    async fn get_record_lengths(&self, host_id: i64) -> Result<BTreeMap<RecordId, usize>> {
        // ---
        let state = self.state.read();
        let mut lengths = BTreeMap::new();
        for (id, record) in state.records.iter().filter(|(_, r)| r.key.host_id == host_id) {
            let count = state
                .partitions
                .get(&self.router.partition_for(*id))
                .and_then(|rows| {
                    distinct_cadence_counts(rows.iter().filter(|r| r.record_id == *id))
                        .get(id)
                        .copied()
                })
                .unwrap_or(0);
            debug!("Record {} of host {} has {} cadences", id, record.key.host_id, count);
            lengths.insert(*id, count);
        }
        Ok(lengths)
    }

    async fn dump_partition(&self, id: RecordId) -> Result<Vec<RawPoint>> {
        // ---
        let range = self.router.partition_for(id);
        let mut rows = self
            .state
            .read()
            .partitions
            .get(&range)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.record_id, r.point.cadence, r.seq));
        Ok(rows)
    }

    async fn append_points(&self, id: RecordId, points: &[Point]) -> Result<usize> {
        let router = self.router;
        self.transact(|state| {
            state.ensure_exists(id)?;
            state.append(&router, id, points);
            Ok(points.len())
        })
    }

    async fn merge_points(&self, id: RecordId, batches: &[Vec<Point>]) -> Result<usize> {
        // ---
        let router = self.router;
        self.transact(|state| {
            state.ensure_exists(id)?;
            let mut merged = Lightcurve::from_sorted(state.points(&router, id));
            let len = merged.merge(batches.iter().cloned());
            state.remove_rows(&router, id, None);
            state.append(&router, id, merged.points());
            debug!("Merged {} batches into record {}", batches.len(), id);
            Ok(len)
        })
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn resolve_id(&self, key: &NaturalKey) -> Result<RecordId> {
        self.state
            .read()
            .keys
            .get(key)
            .copied()
            .ok_or_else(|| ArchiveError::NotFound(format!("record {key}")))
    }

    async fn get_record(&self, id: RecordId) -> Result<Record> {
        // ---
        let state = self.state.read();
        let stored = state
            .records
            .get(&id)
            .ok_or_else(|| ArchiveError::record_not_found(id))?;
        Ok(Record {
            id: Some(id),
            key: stored.key.clone(),
            created_on: stored.created_on,
            lightcurve: Lightcurve::from_sorted(state.points(&self.router, id)),
        })
    }

    async fn records_for_host(&self, host_id: i64) -> Result<Vec<Record>> {
        // ---
        let ids: Vec<RecordId> = self
            .state
            .read()
            .records
            .iter()
            .filter(|(_, r)| r.key.host_id == host_id)
            .map(|(id, _)| *id)
            .collect();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(self.get_record(id).await?);
        }
        Ok(records)
    }

    async fn persist(
        &self,
        batch: &[PendingWrite],
        resolve_conflicts: bool,
    ) -> Result<Vec<Persisted>> {
        // ---
        let router = self.router;
        let persisted = self.transact(|state| {
            batch
                .iter()
                .map(|write| state.apply(&router, write, resolve_conflicts))
                .collect::<Result<Vec<_>>>()
        })?;
        info!("Persisted batch of {} records", persisted.len());
        Ok(persisted)
    }

    async fn delete_record(&self, id: RecordId) -> Result<()> {
        // ---
        let router = self.router;
        self.transact(|state| {
            let stored = state
                .records
                .remove(&id)
                .ok_or_else(|| ArchiveError::record_not_found(id))?;
            state.keys.remove(&stored.key);
            state.remove_rows(&router, id, None);
            let edges = state.lineage.remove_record(id);
            debug!("Deleted record {} and {} lineage edges", id, edges);
            Ok(())
        })
    }
}

#[async_trait]
impl LineageStore for MemoryStore {
    async fn link(&self, source: RecordId, derived: RecordId) -> Result<()> {
        self.transact(|state| {
            if source == derived {
                return Err(ArchiveError::SelfLink(source));
            }
            state.ensure_exists(source)?;
            state.ensure_exists(derived)?;
            state.lineage.link(source, derived)
        })
    }

    async fn unlink(&self, source: RecordId, derived: RecordId) -> Result<()> {
        self.state.write().lineage.unlink(source, derived);
        Ok(())
    }

    async fn sources_of(&self, id: RecordId) -> Result<Vec<RecordHeader>> {
        let state = self.state.read();
        Ok(state
            .lineage
            .sources_of(id)
            .into_iter()
            .filter_map(|src| state.header(src))
            .collect())
    }

    async fn derived_from(&self, id: RecordId) -> Result<Vec<RecordHeader>> {
        let state = self.state.read();
        Ok(state
            .lineage
            .derived_from(id)
            .into_iter()
            .filter_map(|dst| state.header(dst))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::num::NonZeroU32;

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn write(host: i64, aperture: &str, cadences: &[i64]) -> PendingWrite {
        PendingWrite {
            id: None,
            key: NaturalKey::new(host, aperture, "KSPMagnitude"),
            created_on: Utc::now(),
            points: cadences
                .iter()
                .map(|c| Point::at(*c).with_value(*c as f64))
                .collect(),
            replace: false,
        }
    }

    fn cadences_of(points: &[Point]) -> Vec<i64> {
        points.iter().map(|p| p.cadence).collect()
    }

    #[tokio::test]
    async fn test_records_spread_over_partitions() {
        // ---
        let router = PartitionRouter::new(NonZeroU32::new(2).unwrap());
        let store = MemoryStore::with_router(router, 1);
        let batch: Vec<_> = (0..4).map(|i| write(i, "Aperture_000", &[1, 2])).collect();
        let persisted = assert_ok!(store.persist(&batch, false).await);
        let ids: Vec<_> = persisted.iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(
            store.partitions(),
            vec![
                PartitionRange { begin: 0, end: 2 },
                PartitionRange { begin: 2, end: 4 },
                PartitionRange { begin: 4, end: 6 },
            ]
        );

        // ids 2 and 3 share a partition
        let dump = assert_ok!(store.dump_partition(RecordId(3)).await);
        assert_eq!(dump.len(), 4);
        assert!(dump.iter().all(|r| r.record_id == RecordId(2) || r.record_id == RecordId(3)));
    }

    #[tokio::test]
    async fn test_appended_duplicates_resolve_to_latest() {
        // ---
        let store = MemoryStore::new();
        let id = assert_ok!(store.persist(&[write(1, "Aperture_000", &[5])], false).await)[0].id;
        assert_ok!(
            store
                .append_points(id, &[Point::at(5).with_value(50.0), Point::at(6)])
                .await
        );
        let points = assert_ok!(store.get_points_by_record_id(id).await);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 50.0);
        assert_eq!(assert_ok!(store.dump_partition(id).await).len(), 3);
    }

    #[tokio::test]
    async fn test_append_to_missing_record_fails() {
        // ---
        let store = MemoryStore::new();
        let err = assert_err!(store.append_points(RecordId(77), &[Point::at(1)]).await);
        assert!(matches!(err, ArchiveError::NotFound(_)));
        assert!(store.partitions().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_points_and_edges() {
        // ---
        let store = MemoryStore::new();
        let persisted = assert_ok!(
            store
                .persist(&[write(1, "Aperture_000", &[1]), write(1, "Aperture_001", &[1])], false)
                .await
        );
        let (a, b) = (persisted[0].id, persisted[1].id);
        assert_ok!(store.link(a, b).await);
        assert_ok!(store.delete_record(a).await);

        assert!(assert_ok!(store.get_points_by_record_id(a).await).is_empty());
        assert!(assert_ok!(store.sources_of(b).await).is_empty());
        assert_eq!(store.record_count(), 1);
        let err = assert_err!(store.delete_record(a).await);
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_by_id_keeps_unwritten_cadences() {
        // ---
        let store = MemoryStore::new();
        let id = assert_ok!(store.persist(&[write(1, "Aperture_000", &[1, 2, 3])], false).await)[0].id;

        let mut update = write(1, "Aperture_000", &[3, 4]);
        update.id = Some(id);
        update.points[0].value = -3.0;
        let persisted = assert_ok!(store.persist(&[update], false).await);
        assert_eq!(persisted[0].action, PersistAction::Updated);

        let points = assert_ok!(store.get_points_by_record_id(id).await);
        assert_eq!(cadences_of(&points), vec![1, 2, 3, 4]);
        assert_eq!(points[2].value, -3.0);
        // One row per cadence, no stale duplicate of cadence 3
        assert_eq!(assert_ok!(store.dump_partition(id).await).len(), 4);
    }

    #[tokio::test]
    async fn test_replacing_write_drops_unwritten_cadences() {
        // ---
        let store = MemoryStore::new();
        let id = assert_ok!(store.persist(&[write(1, "Aperture_000", &[1, 2, 3])], false).await)[0].id;

        let mut update = write(1, "Aperture_000", &[7]);
        update.id = Some(id);
        update.replace = true;
        assert_ok!(store.persist(&[update], false).await);

        let points = assert_ok!(store.get_points_by_record_id(id).await);
        assert_eq!(cadences_of(&points), vec![7]);
    }
}
