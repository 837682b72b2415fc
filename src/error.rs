//! Versioning error types with stable numeric codes.
//!
//! [`VersioningError`] is the central error type of the crate. Every failure
//! surfaces to the immediate caller; the only local recovery anywhere in the
//! crate is rolling back the store transaction the failure happened in.

use crate::domain::RecordId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VersioningError>;

/// Error enum for schema derivation, record lifecycle and migrations.
///
/// # Error Code Ranges
///
/// | Range     | Category           | Recoverable |
/// |-----------|--------------------|-------------|
/// | 1000–1999 | Schema definition  | no          |
/// | 2000–2999 | Lookup / input     | yes         |
/// | 3000–3999 | History integrity  | no          |
/// | 4000–4999 | Storage / decoding | depends     |
#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    /// A declared field (or table name) collides with a name the shadow
    /// schema reserves for itself.
    #[error("schema conflict on `{table}`: {reason}")]
    SchemaConflict {
        /// Table the conflicting definition belongs to.
        table: String,
        /// What collided.
        reason: String,
    },

    /// A schema definition is malformed (bad identifier, duplicate field).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// More than one open snapshot exists for a single record.
    #[error("{open_count} open snapshots found in `{table}` for record {record_id}")]
    ConsistencyViolation {
        /// Shadow table holding the corrupted history.
        table: String,
        /// Live record whose history is corrupted.
        record_id: RecordId,
        /// Number of rows with `valid_until IS NULL`.
        open_count: usize,
    },

    /// Attempt to close a snapshot whose `valid_until` is already set.
    #[error("snapshot {snapshot_id} in `{table}` is already closed")]
    AlreadyClosed {
        /// Shadow table holding the snapshot.
        table: String,
        /// Surrogate key of the snapshot.
        snapshot_id: i64,
    },

    /// A revert target does not resolve to any snapshot.
    #[error("version {target} not found for record {record_id}")]
    VersionNotFound {
        /// Record the lookup ran against.
        record_id: RecordId,
        /// Human-readable form of the requested target.
        target: String,
    },

    /// The live row for a persisted record no longer exists.
    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    /// The record cannot take part in the requested operation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A serialized migration plan could not be parsed.
    #[error("invalid migration plan: {0}")]
    InvalidPlan(#[from] serde_json::Error),

    /// Underlying store failure. The enclosing transaction has been rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl VersioningError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::SchemaConflict { .. } => 1001,
            Self::InvalidSchema(_) => 1002,
            Self::VersionNotFound { .. } => 2001,
            Self::RecordNotFound(_) => 2002,
            Self::InvalidRecord(_) => 2003,
            Self::InvalidPlan(_) => 2004,
            Self::ConsistencyViolation { .. } => 3001,
            Self::AlreadyClosed { .. } => 3002,
            Self::Storage(_) => 4001,
        }
    }

    /// Returns `true` for errors that indicate a broken definition or
    /// corrupted history rather than a bad request.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaConflict { .. }
                | Self::InvalidSchema(_)
                | Self::ConsistencyViolation { .. }
                | Self::AlreadyClosed { .. }
        )
    }

    pub(crate) fn conflict(table: &str, reason: impl Into<String>) -> Self {
        Self::SchemaConflict {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}
