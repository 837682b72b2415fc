//! Version snapshots and revert targets.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordId, Value};

/// One row of a shadow table: the state of a live record over
/// `[valid_from, valid_until)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Surrogate key, never reused.
    pub snapshot_id: i64,
    /// Weak reference to the live record.
    pub record_id: RecordId,
    /// Position in the record's history, starting at 1.
    pub version_number: i64,
    /// When this snapshot became current.
    pub valid_from: DateTime<Utc>,
    /// When this snapshot stopped being current; `None` while open.
    pub valid_until: Option<DateTime<Utc>>,
    /// Tombstone flag, set on the snapshot written by a delete.
    pub deleted: bool,
    /// Copied field values.
    pub fields: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Returns `true` while this is the record's current snapshot.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.valid_until.is_none()
    }

    /// Copied value of `field`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// What a revert should restore.
///
/// Integers convert the way callers usually write them: a positive number
/// is an absolute version, zero or a negative number counts back from the
/// current version.
#[derive(Debug, Clone, PartialEq)]
pub enum RevertTarget {
    /// Absolute version number (`>= 1`).
    Version(i64),
    /// Relative offset (`<= 0`). `0` and `-1` both select the most recent
    /// closed snapshot, `-n` the snapshot `n` versions before the current one.
    Offset(i64),
    /// A snapshot handle obtained earlier.
    Snapshot(Box<Snapshot>),
}

impl From<i64> for RevertTarget {
    fn from(n: i64) -> Self {
        if n > 0 {
            Self::Version(n)
        } else {
            Self::Offset(n)
        }
    }
}

impl From<i32> for RevertTarget {
    fn from(n: i32) -> Self {
        Self::from(i64::from(n))
    }
}

impl From<Snapshot> for RevertTarget {
    fn from(snapshot: Snapshot) -> Self {
        Self::Snapshot(Box::new(snapshot))
    }
}

impl From<&Snapshot> for RevertTarget {
    fn from(snapshot: &Snapshot) -> Self {
        Self::Snapshot(Box::new(snapshot.clone()))
    }
}

impl fmt::Display for RevertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(n) => write!(f, "version {n}"),
            Self::Offset(k) => write!(f, "offset {k}"),
            Self::Snapshot(s) => write!(f, "snapshot {}", s.snapshot_id),
        }
    }
}
