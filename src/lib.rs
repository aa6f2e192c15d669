//! Core of the TESS lightcurve archive.
//!
//! Lightcurves are stored as per-cadence points in a relational backend
//! partitioned by record id. This crate provides:
//! - [`partition`]: record id to partition routing and partition DDL
//! - [`dedup`]: one point per cadence, latest write wins
//! - [`lightcurve`]: cadence-ordered column views and field assignment
//! - [`manager`]: the in-memory record index with batched persistence
//! - [`lineage`]: source/derived relations between records
//! - [`store`]: the storage seam with PostgreSQL and in-memory backends
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP): sibling
//! modules import shared types through their parent and the commonly used
//! names are re-exported here.

pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod lightcurve;
pub mod lineage;
pub mod manager;
pub mod models;
pub mod partition;
pub mod schema;
pub mod store;

pub use config::Config;
pub use db::Db;
pub use error::{ArchiveError, Result};
pub use lightcurve::{Field, FieldValues, Lightcurve, LightcurveArrays};
pub use lineage::LineageGraph;
pub use manager::{FlushReport, Key, KeyQuery, Lookup, RecordIndex, RecordPatch, TrackState, View};
pub use models::{NaturalKey, Point, QualityFlags, RawPoint, Record, RecordHeader, RecordId};
pub use partition::{PartitionRange, PartitionRouter, DEFAULT_PARTITION_SIZE};
pub use store::{
    LineageStore, MemoryStore, PendingWrite, PersistAction, Persisted, PgStore, PointStore,
    RecordStore, Store,
};
