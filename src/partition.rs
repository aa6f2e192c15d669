//! Partition routing for lightcurve points.
//!
//! Points are physically sharded by owning record id into fixed-width ranges.
//! The range covering `[B, B + size)` is named `<parent>_<B>_<B + size>`.
//! Routing is pure arithmetic: the storage layer and any client compute the
//! same partition for the same id without a lookup table.

use std::fmt;
use std::num::NonZeroU32;

use serde::Serialize;

use crate::models::RecordId;

/// Partition width used by the reference deployment.
pub const DEFAULT_PARTITION_SIZE: NonZeroU32 = match NonZeroU32::new(1000) {
    Some(size) => size,
    None => unreachable!(),
};

/// Parent table of the partitioned point storage.
pub const POINTS_TABLE: &str = "points";

// ---

/// Half-open id range `[begin, end)` held by one physical partition.
///
/// The outermost ranges are clamped to the id domain: a range ending at
/// `i64::MAX` also holds `i64::MAX` and maps to `MAXVALUE` in DDL, and one
/// beginning at `i64::MIN` maps to `MINVALUE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionRange {
    pub begin: i64,
    pub end: i64,
}

impl PartitionRange {
    pub fn contains(&self, id: RecordId) -> bool {
        self.begin <= id.0 && (id.0 < self.end || self.end == i64::MAX)
    }

    /// Physical table name under `parent`, e.g. `points_1000_2000`.
    pub fn table_name(&self, parent: &str) -> String {
        // Negative bounds would put '-' in an identifier.
        let fmt_bound = |b: i64| {
            if b < 0 {
                format!("n{}", b.unsigned_abs())
            } else {
                b.to_string()
            }
        };
        format!("{}_{}_{}", parent, fmt_bound(self.begin), fmt_bound(self.end))
    }

    /// DDL attaching this range as a partition of `parent`.
    pub fn ddl(&self, parent: &str) -> String {
        // ---
        let begin = match self.begin {
            i64::MIN => "MINVALUE".to_string(),
            b => b.to_string(),
        };
        let end = match self.end {
            i64::MAX => "MAXVALUE".to_string(),
            e => e.to_string(),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
            self.table_name(parent),
            parent,
            begin,
            end
        )
    }

    /// Parse a Postgres partition bound expression of the form
    /// `FOR VALUES FROM ('1000') TO ('2000')`. Quotes are optional.
    pub fn parse_bound_expr(expr: &str) -> Option<PartitionRange> {
        // ---
        let rest = expr.trim().strip_prefix("FOR VALUES FROM (")?;
        let (begin, rest) = rest.split_once(')')?;
        let rest = rest.trim_start().strip_prefix("TO (")?;
        let (end, tail) = rest.split_once(')')?;
        if !tail.trim().is_empty() {
            return None;
        }
        let parse = |s: &str| match s.trim().trim_matches('\'') {
            "MINVALUE" => Some(i64::MIN),
            "MAXVALUE" => Some(i64::MAX),
            bound => bound.parse::<i64>().ok(),
        };
        let range = PartitionRange {
            begin: parse(begin)?,
            end: parse(end)?,
        };
        (range.begin < range.end).then_some(range)
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Maps record ids to partition ranges of a fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    size: NonZeroU32,
}

impl Default for PartitionRouter {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION_SIZE)
    }
}

impl PartitionRouter {
    pub const fn new(size: NonZeroU32) -> Self {
        Self { size }
    }

    pub fn size(&self) -> i64 {
        i64::from(self.size.get())
    }

    /// Partition holding the points of `id`.
    ///
    /// `begin = floor(id / size) * size`. An id on a boundary belongs to the
    /// partition starting at that boundary. Bounds past the `i64` domain are
    /// clamped to `i64::MIN` / `i64::MAX`.
    pub fn partition_for(&self, id: RecordId) -> PartitionRange {
        // ---
        let size = self.size();
        let mut quotient = id.0.div_euclid(size);
        // i64::MAX itself never starts a range; the range below runs through it
        if quotient > 0 && quotient.checked_mul(size) == Some(i64::MAX) {
            quotient -= 1;
        }
        PartitionRange {
            begin: quotient.saturating_mul(size),
            end: quotient.saturating_add(1).saturating_mul(size),
        }
    }

    /// Number of new partitions required so that `estimated_new_ids` further
    /// ids beyond `current_max_id` fit below the exclusive bound
    /// `current_partition_end` plus the new ranges. Never negative.
    pub fn new_partitions_needed(
        &self,
        current_max_id: i64,
        current_partition_end: i64,
        estimated_new_ids: i64,
    ) -> u64 {
        // ---
        let overflow = i128::from(current_max_id) + i128::from(estimated_new_ids) + 1
            - i128::from(current_partition_end);
        if overflow <= 0 {
            return 0;
        }
        let size = i128::from(self.size());
        // Ceiling division on a positive numerator.
        u64::try_from((overflow + size - 1) / size).unwrap_or(u64::MAX)
    }

    /// Ranges needed to cover every id in `ids`, sorted and without repeats.
    pub fn covering<I>(&self, ids: I) -> Vec<PartitionRange>
    where
        I: IntoIterator<Item = RecordId>,
    {
        let mut ranges: Vec<_> = ids.into_iter().map(|id| self.partition_for(id)).collect();
        ranges.sort();
        ranges.dedup();
        ranges
    }
}
