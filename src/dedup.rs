//! Cadence deduplication.
//!
//! Raw point storage may hold several rows for one `(record_id, cadence)`
//! pair when a record is re-processed. Reads collapse them to one point per
//! cadence: the row with the highest ingestion sequence (`seq`) wins, so the
//! latest write is what callers see. The Postgres function
//! `get_points_by_record_id` applies the same rule with
//! `DISTINCT ON (cadence) ... ORDER BY cadence, seq DESC`.

use std::collections::BTreeMap;

use crate::models::{Point, RawPoint, RecordId};

// ---

/// Collapse the raw rows owned by `record_id` to a cadence-ascending series
/// with one point per cadence. Rows of other records are ignored, so a whole
/// partition dump can be passed in. No rows yields an empty series.
pub fn dedup_points<'a, I>(record_id: RecordId, raw: I) -> Vec<Point>
where
    I: IntoIterator<Item = &'a RawPoint>,
{
    // ---
    let mut winners: BTreeMap<i64, &RawPoint> = BTreeMap::new();
    for row in raw.into_iter().filter(|r| r.record_id == record_id) {
        winners
            .entry(row.point.cadence)
            .and_modify(|current| {
                if row.seq > current.seq {
                    *current = row;
                }
            })
            .or_insert(row);
    }
    winners.into_values().map(|row| row.point).collect()
}

/// Count of distinct cadences per record among `raw`.
pub fn distinct_cadence_counts<'a, I>(raw: I) -> BTreeMap<RecordId, usize>
where
    I: IntoIterator<Item = &'a RawPoint>,
{
    // ---
    let mut seen: BTreeMap<RecordId, std::collections::BTreeSet<i64>> = BTreeMap::new();
    for row in raw {
        seen.entry(row.record_id).or_default().insert(row.point.cadence);
    }
    seen.into_iter().map(|(id, cadences)| (id, cadences.len())).collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn raw(seq: i64, record: i64, cadence: i64, value: f64) -> RawPoint {
        RawPoint {
            seq,
            record_id: RecordId(record),
            point: Point::at(cadence).with_value(value),
        }
    }

    #[test]
    fn test_latest_write_wins() {
        // ---
        let rows = vec![
            raw(1, 7, 10, 1.0),
            raw(5, 7, 10, 5.0),
            raw(3, 7, 10, 3.0),
            raw(2, 7, 11, 2.0),
        ];
        let points = dedup_points(RecordId(7), &rows);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].cadence, 10);
        assert_eq!(points[0].value, 5.0);
        assert_eq!(points[1].value, 2.0);
    }

    #[test]
    fn test_output_is_strictly_ascending() {
        // ---
        let rows: Vec<_> = [50, 3, 20, 3, 7, 50, 1]
            .iter()
            .enumerate()
            .map(|(i, c)| raw(i as i64, 1, *c, 0.0))
            .collect();
        let cadences: Vec<_> = dedup_points(RecordId(1), &rows)
            .iter()
            .map(|p| p.cadence)
            .collect();
        assert_eq!(cadences, vec![1, 3, 7, 20, 50]);
        assert!(cadences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_is_idempotent() {
        // ---
        let rows = vec![raw(2, 1, 4, 0.5), raw(1, 1, 4, 0.1), raw(3, 1, 2, 0.2)];
        assert_eq!(dedup_points(RecordId(1), &rows), dedup_points(RecordId(1), &rows));
    }

    #[test]
    fn test_unknown_record_is_empty() {
        // ---
        let rows = vec![raw(1, 1, 4, 0.5)];
        assert!(dedup_points(RecordId(2), &rows).is_empty());
        assert!(dedup_points(RecordId(2), &[]).is_empty());
    }

    #[test]
    fn test_distinct_cadence_counts() {
        // ---
        let rows = vec![raw(1, 1, 4, 0.0), raw(2, 1, 4, 0.0), raw(3, 1, 5, 0.0), raw(4, 2, 4, 0.0)];
        let counts = distinct_cadence_counts(&rows);
        assert_eq!(counts[&RecordId(1)], 2);
        assert_eq!(counts[&RecordId(2)], 1);
    }
}
