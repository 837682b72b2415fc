//! Type-safe live record identifier.
//!
//! [`RecordId`] is a newtype over the live table's integer primary key, so
//! record keys cannot be confused with snapshot ids or version numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary key of a live record.
///
/// Also stored by value in every snapshot as the weak reference back to
/// the live row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    /// Wraps a raw primary key.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw primary key.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<RecordId> for i64 {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_raw_key() {
        assert_eq!(RecordId::new(17).to_string(), "17");
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&RecordId::new(5)).ok();
        assert_eq!(json.as_deref(), Some("5"));
    }

    #[test]
    fn ordering_follows_key() {
        assert!(RecordId::new(1) < RecordId::new(2));
        assert_eq!(i64::from(RecordId::from(9)), 9);
    }
}
