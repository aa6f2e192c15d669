//! Error taxonomy for the lightcurve archive core.
//!
//! Every failure is returned synchronously at the offending call. Absence of
//! points is never an error: it yields an empty result instead.

use crate::models::{NaturalKey, RecordId};

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors raised by the partition router, assembler, record index, lineage
/// graph and the store implementations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A natural-key or id lookup matched zero records.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lookup that required exactly one record matched several.
    #[error("Ambiguous key {query}: {matches} records match")]
    AmbiguousKey { query: String, matches: usize },

    /// A second in-memory record was added with an already tracked key.
    #[error("Duplicate key: {0} is already tracked")]
    DuplicateKey(NaturalKey),

    /// Store level unique or foreign-key violation. The batch was rolled back.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Value array length does not match the cadence key set.
    #[error("Length mismatch: {keys} cadences but {values} values")]
    LengthMismatch { keys: usize, values: usize },

    /// A lineage edge from a record to itself.
    #[error("Record {0} cannot be linked to itself")]
    SelfLink(RecordId),

    /// Two records share a natural key but carry different surrogate ids.
    #[error("Record {incoming} conflicts with tracked record {tracked} for {key}")]
    IdConflict {
        key: NaturalKey,
        tracked: RecordId,
        incoming: RecordId,
    },

    /// A store was requested from a closed connection scope.
    #[error("Database connection is not open")]
    ConnectionClosed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ArchiveError {
    /// Shorthand for a [`ArchiveError::NotFound`] describing a record id.
    pub fn record_not_found(id: RecordId) -> Self {
        Self::NotFound(format!("record {id}"))
    }

    /// Map a sqlx error raised inside a write transaction.
    ///
    /// Unique (23505), foreign-key (23503) and check (23514) violations become
    /// [`ArchiveError::ConstraintViolation`]; everything else stays a
    /// database error.
    pub fn from_write(err: sqlx::Error) -> Self {
        // ---
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(db_err.code().as_deref(), Some("23505" | "23503" | "23514")) {
                return Self::ConstraintViolation(db_err.message().to_string());
            }
        }
        Self::Database(err)
    }
}
