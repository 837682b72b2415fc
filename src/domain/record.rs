//! In-memory live records and their persistence state.

use std::collections::BTreeMap;

use super::{RecordId, Value};

/// Persistence state of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Never saved, or deleted since.
    Transient,
    /// Backed by a live row.
    Persisted,
}

/// A live record: field values plus what was last loaded from or saved to
/// the store.
///
/// Change detection compares the current values with the last synchronised
/// ones. After a failed save the current values are left as the caller set
/// them; reload the record to resynchronise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    id: Option<RecordId>,
    values: BTreeMap<String, Value>,
    synced: Option<BTreeMap<String, Value>>,
}

impl Record {
    /// Creates an empty transient record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Record::set`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Assigns a field value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    /// Current value of a field, if assigned.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// All current values, by field name.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Primary key, once persisted.
    #[must_use]
    pub const fn id(&self) -> Option<RecordId> {
        self.id
    }

    /// Whether the record is backed by a live row.
    #[must_use]
    pub const fn state(&self) -> RecordState {
        if self.id.is_some() {
            RecordState::Persisted
        } else {
            RecordState::Transient
        }
    }

    /// Returns `true` if saving would change the store.
    ///
    /// Transient records are always dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        match (&self.id, &self.synced) {
            (Some(_), Some(_)) => !self.changed_fields().is_empty(),
            _ => true,
        }
    }

    /// Names of fields whose value differs from the last synchronised state.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        let Some(synced) = &self.synced else {
            return self.values.keys().map(String::as_str).collect();
        };
        self.values
            .iter()
            .filter(|(name, value)| {
                // An unassigned field reads as NULL.
                synced.get(*name).unwrap_or(&Value::Null) != *value
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Marks the record as backed by `id` with `values` as its stored state.
    pub(crate) fn mark_persisted(&mut self, id: RecordId, values: BTreeMap<String, Value>) {
        self.id = Some(id);
        self.synced = Some(values.clone());
        self.values = values;
    }

    /// Detaches the record from its deleted live row, keeping its values.
    pub(crate) fn mark_transient(&mut self) {
        self.id = None;
        self.synced = None;
    }
}
