//! Record lineage: the directed source -> derived relation between records.
//!
//! Edges are held in two adjacency maps keyed by record id rather than as
//! references between records, so removing a record is a plain edge filter.
//! Self-loops are rejected. Longer cycles are not detected; callers must
//! avoid them. The transitive walks below track visited ids and terminate
//! regardless.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{ArchiveError, Result};
use crate::models::RecordId;

// ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageGraph {
    /// source -> records derived from it
    derived: BTreeMap<RecordId, BTreeSet<RecordId>>,
    /// derived -> its sources
    sources: BTreeMap<RecordId, BTreeSet<RecordId>>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `derived` was computed from `source`. Linking an existing
    /// edge again is a no-op.
    pub fn link(&mut self, source: RecordId, derived: RecordId) -> Result<()> {
        // ---
        if source == derived {
            return Err(ArchiveError::SelfLink(source));
        }
        self.derived.entry(source).or_default().insert(derived);
        self.sources.entry(derived).or_default().insert(source);
        Ok(())
    }

    /// Remove an edge. Returns whether it existed; a missing edge is not an
    /// error.
    pub fn unlink(&mut self, source: RecordId, derived: RecordId) -> bool {
        // ---
        let removed = remove_from(&mut self.derived, source, derived);
        remove_from(&mut self.sources, derived, source);
        removed
    }

    pub fn contains(&self, source: RecordId, derived: RecordId) -> bool {
        self.derived
            .get(&source)
            .is_some_and(|set| set.contains(&derived))
    }

    /// Direct sources of `id`.
    pub fn sources_of(&self, id: RecordId) -> BTreeSet<RecordId> {
        self.sources.get(&id).cloned().unwrap_or_default()
    }

    /// Records directly derived from `id`.
    pub fn derived_from(&self, id: RecordId) -> BTreeSet<RecordId> {
        self.derived.get(&id).cloned().unwrap_or_default()
    }

    /// Every record `id` was transitively derived from.
    pub fn ancestors(&self, id: RecordId) -> BTreeSet<RecordId> {
        walk(&self.sources, id)
    }

    /// Every record transitively derived from `id`.
    pub fn descendants(&self, id: RecordId) -> BTreeSet<RecordId> {
        walk(&self.derived, id)
    }

    /// Drop every edge touching `id`. Returns the number of edges removed.
    pub fn remove_record(&mut self, id: RecordId) -> usize {
        // ---
        let mut removed = 0;
        if let Some(children) = self.derived.remove(&id) {
            for child in &children {
                remove_from(&mut self.sources, *child, id);
            }
            removed += children.len();
        }
        if let Some(parents) = self.sources.remove(&id) {
            for parent in &parents {
                remove_from(&mut self.derived, *parent, id);
            }
            removed += parents.len();
        }
        removed
    }

    /// All edges as `(source, derived)` pairs in ascending order.
    pub fn edges(&self) -> impl Iterator<Item = (RecordId, RecordId)> + '_ {
        self.derived
            .iter()
            .flat_map(|(src, set)| set.iter().map(move |dst| (*src, *dst)))
    }

    pub fn edge_count(&self) -> usize {
        self.derived.values().map(BTreeSet::len).sum()
    }
}

fn remove_from(
    map: &mut BTreeMap<RecordId, BTreeSet<RecordId>>,
    key: RecordId,
    value: RecordId,
) -> bool {
    // ---
    let Some(set) = map.get_mut(&key) else {
        return false;
    };
    let removed = set.remove(&value);
    if set.is_empty() {
        map.remove(&key);
    }
    removed
}

/// Breadth-first closure over `adjacency`, excluding `start` itself.
fn walk(adjacency: &BTreeMap<RecordId, BTreeSet<RecordId>>, start: RecordId) -> BTreeSet<RecordId> {
    // ---
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(&id).into_iter().flatten() {
            if *next != start && seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    seen
}
