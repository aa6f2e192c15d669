//! Data models shared by the router, assembler, index and stores.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lightcurve::Lightcurve;

// ---

/// Surrogate identifier of a stored record. Drives partition routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-cadence quality bit flags. Bit 0 set means the cadence is bad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityFlags(pub u32);

impl QualityFlags {
    pub const OK: QualityFlags = QualityFlags(0);
    pub const BAD: QualityFlags = QualityFlags(1);

    /// True when the bad bit is clear.
    pub fn is_ok(self) -> bool {
        self.0 & Self::BAD.0 == 0
    }

    pub fn contains(self, other: QualityFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One observation of a record at one cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    // ---
    /// Exposure index. Monotonic per record but not contiguous.
    pub cadence: i64,
    /// Mission-epoch relative timestamp (BTJD).
    pub time: f64,
    /// Flux or magnitude, depending on the record's processing type.
    pub value: f64,
    pub error: f64,
    pub x_position: f64,
    pub y_position: f64,
    pub quality: QualityFlags,
}

impl Point {
    /// A point with zeroed measurements, mostly useful for building fixtures.
    pub fn at(cadence: i64) -> Self {
        Self {
            cadence,
            time: 0.0,
            value: 0.0,
            error: 0.0,
            x_position: 0.0,
            y_position: 0.0,
            quality: QualityFlags::OK,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

/// A point as physically stored, before cadence deduplication.
///
/// `seq` is the ingestion sequence number: strictly increasing with every
/// write, so a larger `seq` means a later write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawPoint {
    pub seq: i64,
    pub record_id: RecordId,
    #[serde(flatten)]
    pub point: Point,
}

/// The (host, aperture, type) triple identifying a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    /// TIC identifier of the host star.
    pub host_id: i64,
    pub aperture: String,
    /// Processing type, e.g. `KSPMagnitude`.
    pub kind: String,
}

impl NaturalKey {
    pub fn new(host_id: i64, aperture: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            host_id,
            aperture: aperture.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.host_id, self.aperture, self.kind)
    }
}

/// Identity of a stored record without its points.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordHeader {
    pub id: RecordId,
    pub key: NaturalKey,
}

/// A named, typed time series: the unit tracked by the record index and
/// persisted by the stores.
#[derive(Debug, Clone)]
pub struct Record {
    // ---
    /// `None` until the record has been persisted.
    pub id: Option<RecordId>,
    pub key: NaturalKey,
    pub created_on: DateTime<Utc>,
    pub lightcurve: Lightcurve,
}

impl Record {
    /// Build an unpersisted record from a point batch. Duplicate cadences in
    /// `points` collapse with the later entry winning.
    pub fn new(key: NaturalKey, points: Vec<Point>) -> Self {
        Self {
            id: None,
            key,
            created_on: Utc::now(),
            lightcurve: Lightcurve::from_points(points),
        }
    }

    /// Build a record that already has a surrogate id.
    pub fn stored(id: RecordId, key: NaturalKey, points: Vec<Point>) -> Self {
        Self {
            id: Some(id),
            ..Self::new(key, points)
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn header(&self) -> Option<RecordHeader> {
        self.id.map(|id| RecordHeader {
            id,
            key: self.key.clone(),
        })
    }
}
