//! Record index: an in-memory working set of records addressable by any
//! combination of host id, aperture and processing type.
//!
//! Records live in a flat slot list with one map from the full natural key to
//! its slot and three secondary maps (host, aperture, type) to slot sets.
//! Partial lookups intersect the secondary sets, so keys can be applied in any
//! order. As soon as a lookup narrows to a single record it returns that
//! record instead of a further view.
//!
//! The index also tracks what needs persisting. Each record is
//! [`TrackState::New`], [`TrackState::Clean`] or [`TrackState::Dirty`];
//! [`RecordIndex::flush`] writes every new and dirty record in one batch and
//! only updates these states when the batch commits.
//!
//! The index is single-owner: mutate it from one task, then flush once.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::lightcurve::{FieldValues, Lightcurve};
use crate::models::{NaturalKey, Point, Record, RecordId};
use crate::store::{PendingWrite, PersistAction, RecordStore};

// ---

/// One component of a natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Host(i64),
    Aperture(String),
    Kind(String),
}

impl Key {
    pub fn aperture(name: impl Into<String>) -> Self {
        Key::Aperture(name.into())
    }

    pub fn kind(name: impl Into<String>) -> Self {
        Key::Kind(name.into())
    }

    fn matches(&self, key: &NaturalKey) -> bool {
        match self {
            Key::Host(h) => key.host_id == *h,
            Key::Aperture(a) => key.aperture == *a,
            Key::Kind(k) => key.kind == *k,
        }
    }
}

impl From<i64> for Key {
    fn from(host_id: i64) -> Self {
        Key::Host(host_id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Host(h) => write!(f, "host {h}"),
            Key::Aperture(a) => write!(f, "aperture {a}"),
            Key::Kind(k) => write!(f, "type {k}"),
        }
    }
}

/// Partial natural key. Unset components match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyQuery {
    pub host_id: Option<i64>,
    pub aperture: Option<String>,
    pub kind: Option<String>,
}

impl KeyQuery {
    fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.host_id
            .map(Key::Host)
            .into_iter()
            .chain(self.aperture.clone().map(Key::Aperture))
            .chain(self.kind.clone().map(Key::Kind))
    }
}

impl From<&NaturalKey> for KeyQuery {
    fn from(key: &NaturalKey) -> Self {
        Self {
            host_id: Some(key.host_id),
            aperture: Some(key.aperture.clone()),
            kind: Some(key.kind.clone()),
        }
    }
}

impl From<(i64, &str, &str)> for KeyQuery {
    fn from((host_id, aperture, kind): (i64, &str, &str)) -> Self {
        Self::from(&NaturalKey::new(host_id, aperture, kind))
    }
}

impl fmt::Display for KeyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host_id.map_or("*".to_string(), |h| h.to_string());
        write!(
            f,
            "({}, {}, {})",
            host,
            self.aperture.as_deref().unwrap_or("*"),
            self.kind.as_deref().unwrap_or("*")
        )
    }
}

/// Persistence state of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Never persisted.
    New,
    /// Persisted and unchanged since.
    Clean,
    /// Persisted with unflushed changes.
    Dirty,
}

/// Change applied to a tracked record by [`RecordIndex::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPatch {
    /// Merge points by cadence; incoming points win.
    Merge(Vec<Point>),
    /// Overwrite one field at the given cadences.
    Assign {
        cadences: Vec<i64>,
        values: FieldValues,
    },
    /// Replace the whole point set.
    Replace(Vec<Point>),
}

impl RecordPatch {
    fn apply(&self, lc: &mut Lightcurve) -> Result<()> {
        match self {
            RecordPatch::Merge(points) => {
                lc.merge([points.iter().copied()]);
            }
            RecordPatch::Assign { cadences, values } => {
                lc.assign(cadences, values)?;
            }
            RecordPatch::Replace(points) => {
                *lc = Lightcurve::from_points(points.clone());
            }
        }
        Ok(())
    }
}

/// Outcome of a successful [`RecordIndex::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub merged: usize,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.merged
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    record: Record,
    state: TrackState,
    /// Set by [`RecordPatch::Replace`]: the next flush drops stored cadences
    /// missing from the tracked record.
    replace: bool,
}

/// Result of keying into the index.
#[derive(Debug, Clone)]
pub enum Lookup<'a> {
    /// Exactly one record is reachable.
    One(&'a Record),
    /// Several records remain; key further or iterate.
    Many(View<'a>),
}

impl<'a> Lookup<'a> {
    /// Narrow further. A single record stays selected when it matches `key`.
    pub fn get(self, key: impl Into<Key>) -> Result<Lookup<'a>> {
        // ---
        let key = key.into();
        match self {
            Lookup::One(record) if key.matches(&record.key) => Ok(Lookup::One(record)),
            Lookup::One(record) => Err(ArchiveError::NotFound(format!(
                "{key} for record {}",
                record.key
            ))),
            Lookup::Many(view) => view.get(key),
        }
    }

    pub fn record(&self) -> Option<&'a Record> {
        match self {
            Lookup::One(record) => Some(*record),
            Lookup::Many(_) => None,
        }
    }

    pub fn view(self) -> Option<View<'a>> {
        match self {
            Lookup::One(_) => None,
            Lookup::Many(view) => Some(view),
        }
    }

    /// Number of records reachable from this lookup. Never zero.
    pub fn count(&self) -> usize {
        match self {
            Lookup::One(_) => 1,
            Lookup::Many(view) => view.len(),
        }
    }
}

/// A narrowed, further-keyable subset of the index.
#[derive(Debug, Clone)]
pub struct View<'a> {
    index: &'a RecordIndex,
    slots: BTreeSet<usize>,
}

impl<'a> View<'a> {
    /// Intersect this view with the records matching `key`.
    pub fn get(&self, key: impl Into<Key>) -> Result<Lookup<'a>> {
        // ---
        let key = key.into();
        let matches: BTreeSet<usize> = self
            .index
            .slots_for(&key)
            .map(|set| set.intersection(&self.slots).copied().collect())
            .unwrap_or_default();

        if matches.len() > 1 {
            return Ok(Lookup::Many(View {
                index: self.index,
                slots: matches,
            }));
        }
        match matches.first() {
            Some(slot) => Ok(Lookup::One(&self.index.slots[*slot].record)),
            None => Err(ArchiveError::NotFound(format!("{key}"))),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &'a Record> + '_ {
        self.slots.iter().map(|s| &self.index.slots[*s].record)
    }
}

/// In-memory multi-key index over a working set of records.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    slots: Vec<Tracked>,
    by_key: HashMap<NaturalKey, usize>,
    hosts: HashMap<i64, BTreeSet<usize>>,
    apertures: HashMap<String, BTreeSet<usize>>,
    kinds: HashMap<String, BTreeSet<usize>>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track every record of `records`, merging repeated natural keys.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut index = Self::new();
        for record in records {
            index.add_existing(record)?;
        }
        Ok(index)
    }

    /// Track every stored record of `host_id`. Returns how many records the
    /// store returned.
    pub async fn load_host<S>(&mut self, store: &S, host_id: i64) -> Result<usize>
    where
        S: RecordStore + ?Sized,
    {
        // ---
        let records = store.records_for_host(host_id).await?;
        let n = records.len();
        for record in records {
            self.add_existing(record)?;
        }
        debug!("Loaded {} records of host {}", n, host_id);
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All tracked records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.slots.iter().map(|t| &t.record)
    }

    /// Unnarrowed view over everything tracked.
    pub fn view(&self) -> View<'_> {
        View {
            index: self,
            slots: (0..self.slots.len()).collect(),
        }
    }

    /// Key into the index by one component.
    pub fn get(&self, key: impl Into<Key>) -> Result<Lookup<'_>> {
        self.view().get(key)
    }

    /// Record with exactly this natural key, if tracked.
    pub fn find(&self, key: &NaturalKey) -> Option<&Record> {
        self.by_key.get(key).map(|s| &self.slots[*s].record)
    }

    /// The unique record matching `query`.
    pub fn resolve(&self, query: impl Into<KeyQuery>) -> Result<&Record> {
        let slot = self.resolve_slot(&query.into())?;
        Ok(&self.slots[slot].record)
    }

    pub fn state_of(&self, key: &NaturalKey) -> Option<TrackState> {
        self.by_key.get(key).map(|s| self.slots[*s].state)
    }

    /// Number of records a flush would write.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|t| t.state != TrackState::Clean)
            .count()
    }

    /// Create and track a new record.
    ///
    /// Fails with `DuplicateKey` when the triple is already tracked. This
    /// only sees this index's own records, not rows already in a store.
    pub fn add(
        &mut self,
        host_id: i64,
        aperture: &str,
        kind: &str,
        points: Vec<Point>,
    ) -> Result<&Record> {
        // ---
        let key = NaturalKey::new(host_id, aperture, kind);
        if self.by_key.contains_key(&key) {
            return Err(ArchiveError::DuplicateKey(key));
        }
        let slot = self.track(Record::new(key, points), TrackState::New);
        Ok(&self.slots[slot].record)
    }

    /// Add a new record, or merge `points` into the tracked record with the
    /// same natural key (incoming cadences win).
    pub fn upsert(
        &mut self,
        host_id: i64,
        aperture: &str,
        kind: &str,
        points: Vec<Point>,
    ) -> Result<&Record> {
        // ---
        let key = NaturalKey::new(host_id, aperture, kind);
        if self.by_key.contains_key(&key) {
            self.update(&key, [RecordPatch::Merge(points)])
        } else {
            self.add(host_id, aperture, kind, points)
        }
    }

    /// Track a record coming from a store.
    ///
    /// If the natural key is already tracked, the incoming points are merged
    /// into the tracked record (incoming cadences win) and an unpersisted
    /// tracked record adopts the incoming id. Two different ids for one key
    /// fail with `IdConflict`.
    pub fn add_existing(&mut self, record: Record) -> Result<&Record> {
        // ---
        let Some(slot) = self.by_key.get(&record.key).copied() else {
            let state = if record.is_persisted() {
                TrackState::Clean
            } else {
                TrackState::New
            };
            let slot = self.track(record, state);
            return Ok(&self.slots[slot].record);
        };

        let tracked = &mut self.slots[slot];
        match (tracked.record.id, record.id) {
            (Some(current), Some(incoming)) if current != incoming => {
                return Err(ArchiveError::IdConflict {
                    key: record.key,
                    tracked: current,
                    incoming,
                });
            }
            (None, Some(incoming)) => {
                tracked.record.id = Some(incoming);
                tracked.state = TrackState::Dirty;
            }
            _ => {}
        }

        let before = tracked.record.lightcurve.clone();
        tracked.record.lightcurve.merge([record.lightcurve.into_points()]);
        if tracked.state == TrackState::Clean && tracked.record.lightcurve != before {
            tracked.state = TrackState::Dirty;
        }
        Ok(&self.slots[slot].record)
    }

    /// Apply patches to the unique record matching `query` and mark it for
    /// persistence.
    ///
    /// Fails with `NotFound` or `AmbiguousKey` when `query` does not single
    /// out one record. Patches apply all-or-nothing: if one fails, the record
    /// is left as it was.
    pub fn update<Q, P>(&mut self, query: Q, patches: P) -> Result<&Record>
    where
        Q: Into<KeyQuery>,
        P: IntoIterator<Item = RecordPatch>,
    {
        // ---
        let slot = self.resolve_slot(&query.into())?;
        let tracked = &mut self.slots[slot];

        let mut draft = tracked.record.lightcurve.clone();
        let mut replace = false;
        for patch in patches {
            patch.apply(&mut draft)?;
            replace |= matches!(patch, RecordPatch::Replace(_));
        }
        tracked.record.lightcurve = draft;
        tracked.replace |= replace;
        if tracked.state == TrackState::Clean {
            tracked.state = TrackState::Dirty;
        }
        Ok(&self.slots[slot].record)
    }

    /// Persist every new and dirty record in one transactional batch.
    ///
    /// Records that already exist are written by cadence: stored cadences the
    /// index does not hold are kept, unless the record was patched with
    /// [`RecordPatch::Replace`].
    ///
    /// With `resolve_conflicts`, new records whose key already exists in the
    /// store are merged into the stored record. Without it such a record
    /// fails the whole batch with `ConstraintViolation`. On any failure the
    /// index is left exactly as it was, so the flush can be retried.
    pub async fn flush<S>(&mut self, store: &S, resolve_conflicts: bool) -> Result<FlushReport>
    where
        S: RecordStore + ?Sized,
    {
        // ---
        let pending: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TrackState::Clean)
            .map(|(slot, _)| slot)
            .collect();

        if pending.is_empty() {
            debug!("Nothing to flush");
            return Ok(FlushReport::default());
        }

        let batch: Vec<PendingWrite> = pending
            .iter()
            .map(|slot| {
                let tracked = &self.slots[*slot];
                PendingWrite {
                    replace: tracked.replace,
                    ..PendingWrite::from(&tracked.record)
                }
            })
            .collect();

        let persisted = store.persist(&batch, resolve_conflicts).await?;
        if persisted.len() != pending.len() {
            return Err(ArchiveError::ConstraintViolation(format!(
                "store acknowledged {} of {} writes",
                persisted.len(),
                pending.len()
            )));
        }

        let mut report = FlushReport::default();
        let mut merged = Vec::new();
        for (slot, outcome) in pending.into_iter().zip(persisted) {
            let tracked = &mut self.slots[slot];
            tracked.record.id = Some(outcome.id);
            tracked.state = TrackState::Clean;
            tracked.replace = false;
            match outcome.action {
                PersistAction::Inserted => report.inserted += 1,
                PersistAction::Updated => report.updated += 1,
                PersistAction::Merged => {
                    report.merged += 1;
                    merged.push(slot);
                }
            }
        }

        // A merged record only holds the incoming points; adopt the stored series
        for slot in merged {
            let tracked = &mut self.slots[slot];
            let Some(id) = tracked.record.id else {
                continue;
            };
            match store.get_record(id).await {
                Ok(stored) => {
                    tracked.record.created_on = stored.created_on;
                    tracked.record.lightcurve = stored.lightcurve;
                }
                Err(e) => {
                    warn!("Re-reading merged record {} failed: {}", id, e);
                    tracked.state = TrackState::Dirty;
                }
            }
        }

        info!(
            "Flushed {} records ({} inserted, {} updated, {} merged)",
            report.total(),
            report.inserted,
            report.updated,
            report.merged
        );
        Ok(report)
    }

    /// Ids of all persisted records in insertion order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.slots.iter().filter_map(|t| t.record.id).collect()
    }

    fn track(&mut self, record: Record, state: TrackState) -> usize {
        // ---
        let slot = self.slots.len();
        let key = record.key.clone();
        self.hosts.entry(key.host_id).or_default().insert(slot);
        self.apertures.entry(key.aperture.clone()).or_default().insert(slot);
        self.kinds.entry(key.kind.clone()).or_default().insert(slot);
        self.by_key.insert(key, slot);
        self.slots.push(Tracked {
            record,
            state,
            replace: false,
        });
        slot
    }

    fn slots_for(&self, key: &Key) -> Option<&BTreeSet<usize>> {
        match key {
            Key::Host(h) => self.hosts.get(h),
            Key::Aperture(a) => self.apertures.get(a),
            Key::Kind(k) => self.kinds.get(k),
        }
    }

    fn resolve_slot(&self, query: &KeyQuery) -> Result<usize> {
        // ---
        let mut candidates: BTreeSet<usize> = (0..self.slots.len()).collect();
        for key in query.keys() {
            let Some(set) = self.slots_for(&key) else {
                candidates.clear();
                break;
            };
            candidates = candidates.intersection(set).copied().collect();
        }

        let mut iter = candidates.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Err(ArchiveError::NotFound(format!("record {query}"))),
            (Some(slot), None) => Ok(*slot),
            (Some(_), Some(_)) => Err(ArchiveError::AmbiguousKey {
                query: query.to_string(),
                matches: candidates.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const HOSTS: [i64; 2] = [100, 200];
    const APERTURES: [&str; 2] = ["Aperture_000", "Aperture_001"];
    const KINDS: [&str; 2] = ["KSPMagnitude", "RawMagnitude"];

    fn points(cadences: &[i64]) -> Vec<Point> {
        cadences.iter().map(|c| Point::at(*c)).collect()
    }

    /// Every combination of the constants above: 8 records.
    fn populated() -> RecordIndex {
        let mut index = RecordIndex::new();
        for h in HOSTS {
            for a in APERTURES {
                for k in KINDS {
                    index.add(h, a, k, points(&[1, 2])).unwrap();
                }
            }
        }
        index
    }

    #[test]
    fn test_duplicate_triple_rejected() {
        // ---
        let mut index = RecordIndex::new();
        index.add(1, "Aperture_000", "KSPMagnitude", vec![]).unwrap();
        let err = index
            .add(1, "Aperture_000", "KSPMagnitude", points(&[5]))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateKey(_)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_key_permutations_resolve_same_record() {
        // ---
        let index = populated();
        let a = index
            .get(200_i64)
            .unwrap()
            .get(Key::kind("RawMagnitude"))
            .unwrap()
            .get(Key::aperture("Aperture_001"))
            .unwrap();
        let b = index
            .get(Key::aperture("Aperture_001"))
            .unwrap()
            .get(200_i64)
            .unwrap()
            .get(Key::kind("RawMagnitude"))
            .unwrap();
        let a = a.record().unwrap();
        let b = b.record().unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.key, NaturalKey::new(200, "Aperture_001", "RawMagnitude"));
    }

    #[test]
    fn test_partial_keys_return_views() {
        // ---
        let index = populated();
        let by_host = index.get(100_i64).unwrap();
        assert_eq!(by_host.count(), 4);
        let view = by_host.view().unwrap();
        assert!(view.iter().all(|r| r.key.host_id == 100));

        let narrowed = view.get(Key::kind("KSPMagnitude")).unwrap();
        assert_eq!(narrowed.count(), 2);
        assert!(narrowed.record().is_none());
    }

    #[test]
    fn test_single_candidate_collapses_early() {
        // ---
        let mut index = populated();
        index.add(300, "Aperture_009", "KSPMagnitude", vec![]).unwrap();
        let found = index.get(300_i64).unwrap();
        let record = found.record().expect("host 300 has one record");
        assert_eq!(record.key.aperture, "Aperture_009");

        // Keying a single record further keeps it when it matches.
        let again = index.get(300_i64).unwrap().get(Key::kind("KSPMagnitude")).unwrap();
        assert!(again.record().is_some());
        let miss = index.get(300_i64).unwrap().get(Key::kind("RawMagnitude"));
        assert!(matches!(miss, Err(ArchiveError::NotFound(_))));
    }

    #[test]
    fn test_unknown_key_not_found() {
        // ---
        let index = populated();
        assert!(matches!(index.get(999_i64), Err(ArchiveError::NotFound(_))));
        assert!(matches!(
            index.get(Key::aperture("Aperture_404")),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_partial_query() {
        // ---
        let index = populated();
        let query = KeyQuery {
            host_id: Some(100),
            ..Default::default()
        };
        let err = index.resolve(query).unwrap_err();
        assert!(matches!(err, ArchiveError::AmbiguousKey { matches: 4, .. }));

        let record = index.resolve((100_i64, "Aperture_000", "RawMagnitude")).unwrap();
        assert_eq!(record.key.kind, "RawMagnitude");

        let err = index.resolve((101_i64, "Aperture_000", "RawMagnitude")).unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[test]
    fn test_update_marks_dirty_and_checks_lengths() {
        // ---
        let key = NaturalKey::new(5, "Aperture_000", "KSPMagnitude");
        let mut index =
            RecordIndex::from_records([Record::stored(RecordId(50), key.clone(), points(&[1, 2, 3]))])
                .unwrap();
        assert_eq!(index.state_of(&key), Some(TrackState::Clean));

        let err = index
            .update(
                &key,
                [
                    RecordPatch::Merge(points(&[4])),
                    RecordPatch::Assign {
                        cadences: vec![1, 2, 3],
                        values: FieldValues::Value(vec![1.0, 2.0]),
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::LengthMismatch { .. }));
        assert_eq!(index.find(&key).unwrap().lightcurve.len(), 3);
        assert_eq!(index.state_of(&key), Some(TrackState::Clean));

        let record = index
            .update(
                &key,
                [RecordPatch::Assign {
                    cadences: vec![3, 1],
                    values: FieldValues::Value(vec![30.0, 10.0]),
                }],
            )
            .unwrap();
        assert_eq!(record.lightcurve.get(3).unwrap().value, 30.0);
        assert_eq!(index.state_of(&key), Some(TrackState::Dirty));
        assert_eq!(index.pending(), 1);
    }

    #[test]
    fn test_add_existing_merges_into_tracked() {
        // ---
        let key = NaturalKey::new(5, "Aperture_000", "KSPMagnitude");
        let mut index = RecordIndex::new();
        index.add(5, "Aperture_000", "KSPMagnitude", points(&[1, 2])).unwrap();

        let stored = Record::stored(RecordId(77), key.clone(), vec![Point::at(2).with_value(9.0), Point::at(3)]);
        let merged = index.add_existing(stored).unwrap();
        assert_eq!(merged.id, Some(RecordId(77)));
        assert_eq!(merged.lightcurve.cadences(), vec![1, 2, 3]);
        assert_eq!(merged.lightcurve.get(2).unwrap().value, 9.0);
        assert_eq!(index.len(), 1);
        assert_eq!(index.state_of(&key), Some(TrackState::Dirty));

        let other = Record::stored(RecordId(78), key, vec![]);
        let err = index.add_existing(other).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::IdConflict { tracked: RecordId(77), incoming: RecordId(78), .. }
        ));
    }

    #[test]
    fn test_add_existing_same_points_stays_clean() {
        // ---
        let key = NaturalKey::new(5, "Aperture_000", "KSPMagnitude");
        let record = Record::stored(RecordId(1), key.clone(), points(&[1, 2]));
        let mut index = RecordIndex::from_records([record.clone(), record]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.state_of(&key), Some(TrackState::Clean));
        assert_eq!(index.pending(), 0);
        assert_eq!(index.ids(), vec![RecordId(1)]);
        index.add(6, "Aperture_000", "KSPMagnitude", vec![]).unwrap();
        assert_eq!(index.pending(), 1);
    }

    #[test]
    fn test_upsert_adds_then_merges() {
        // ---
        let key = NaturalKey::new(8, "Aperture_001", "KSPMagnitude");
        let mut index = RecordIndex::new();
        index.upsert(8, "Aperture_001", "KSPMagnitude", points(&[1, 2])).unwrap();
        assert_eq!(index.state_of(&key), Some(TrackState::New));

        let record = index
            .upsert(8, "Aperture_001", "KSPMagnitude", vec![Point::at(2).with_value(4.0), Point::at(5)])
            .unwrap();
        assert_eq!(record.lightcurve.cadences(), vec![1, 2, 5]);
        assert_eq!(record.lightcurve.get(2).unwrap().value, 4.0);
        assert_eq!(index.len(), 1);
        assert_eq!(index.state_of(&key), Some(TrackState::New));
    }

    #[test]
    fn test_upsert_marks_stored_record_dirty() {
        // ---
        let key = NaturalKey::new(8, "Aperture_001", "KSPMagnitude");
        let mut index =
            RecordIndex::from_records([Record::stored(RecordId(3), key.clone(), points(&[1]))]).unwrap();
        index.upsert(8, "Aperture_001", "KSPMagnitude", points(&[2])).unwrap();
        assert_eq!(index.state_of(&key), Some(TrackState::Dirty));
        assert_eq!(index.find(&key).unwrap().id, Some(RecordId(3)));
    }
}
