//! Live and shadow table schemas, and the derivation from one to the other.
//!
//! A shadow schema is computed exactly once per live schema by
//! [`derive_shadow_schema`]. The resulting field list is the contract the
//! lifecycle engine uses to copy values between live rows and snapshots.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{FieldDef, FieldKind};
use crate::error::{Result, VersioningError};

/// Suffix appended to a live table name to form its shadow table name.
pub const SHADOW_SUFFIX: &str = "_version";

/// Primary key column of every live table.
pub const LIVE_PRIMARY_KEY: &str = "id";

/// Surrogate primary key of the shadow table.
pub const SNAPSHOT_ID: &str = "snapshot_id";
/// Timestamp the snapshot became current.
pub const VALID_FROM: &str = "valid_from";
/// Timestamp the snapshot stopped being current; `NULL` while open.
pub const VALID_UNTIL: &str = "valid_until";
/// Tombstone flag.
pub const DELETED: &str = "deleted";
/// Weak reference to the live row's primary key.
pub const ORIGINAL_RECORD_ID: &str = "original_record_id";
/// Per-record version counter, starting at 1.
pub const VERSION_NUMBER: &str = "version_number";

/// One fixed column appended to every shadow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookkeepingColumn {
    /// Column name.
    pub name: &'static str,
    /// Storage kind.
    pub kind: FieldKind,
    /// Whether the column accepts `NULL`.
    pub nullable: bool,
    /// Whether this is the shadow table's primary key.
    pub primary_key: bool,
    /// Whether the column gets its own index.
    pub indexed: bool,
    /// SQL default expression, if any.
    pub default_expr: Option<&'static str>,
}

/// The bookkeeping fragment shared by all shadow schemas.
pub const BOOKKEEPING_COLUMNS: [BookkeepingColumn; 6] = [
    BookkeepingColumn {
        name: SNAPSHOT_ID,
        kind: FieldKind::Integer,
        nullable: false,
        primary_key: true,
        indexed: false,
        default_expr: None,
    },
    BookkeepingColumn {
        name: VALID_FROM,
        kind: FieldKind::Timestamp,
        nullable: false,
        primary_key: false,
        indexed: true,
        default_expr: Some("CURRENT_TIMESTAMP"),
    },
    BookkeepingColumn {
        name: VALID_UNTIL,
        kind: FieldKind::Timestamp,
        nullable: true,
        primary_key: false,
        indexed: false,
        default_expr: None,
    },
    BookkeepingColumn {
        name: DELETED,
        kind: FieldKind::Boolean,
        nullable: false,
        primary_key: false,
        indexed: false,
        default_expr: Some("0"),
    },
    BookkeepingColumn {
        name: ORIGINAL_RECORD_ID,
        kind: FieldKind::Integer,
        nullable: false,
        primary_key: false,
        indexed: true,
        default_expr: None,
    },
    BookkeepingColumn {
        name: VERSION_NUMBER,
        kind: FieldKind::Integer,
        nullable: false,
        primary_key: false,
        indexed: false,
        default_expr: Some("1"),
    },
];

/// Returns `true` if `name` is one of the shadow bookkeeping columns.
#[must_use]
pub fn is_bookkeeping_field(name: &str) -> bool {
    BOOKKEEPING_COLUMNS.iter().any(|c| c.name == name)
}

/// Name of the shadow table tracking `live_table`.
#[must_use]
pub fn shadow_table_name(live_table: &str) -> String {
    format!("{live_table}{SHADOW_SUFFIX}")
}

/// Inverse of [`shadow_table_name`]: the live table a shadow table tracks.
#[must_use]
pub fn live_table_name_of(shadow_table: &str) -> Option<&str> {
    shadow_table
        .strip_suffix(SHADOW_SUFFIX)
        .filter(|live| !live.is_empty())
}

/// Checks that `name` is a plain SQL identifier.
///
/// # Errors
///
/// Returns [`VersioningError::InvalidSchema`] otherwise.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(VersioningError::InvalidSchema(format!(
            "`{name}` is not a valid identifier"
        )))
    }
}

/// Schema of a live (tracked) table.
///
/// The implicit primary key [`LIVE_PRIMARY_KEY`] is not part of `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSchema {
    /// Live table name.
    pub table: String,
    /// User-declared fields, in column order.
    pub fields: Vec<FieldDef>,
}

impl LiveSchema {
    /// Creates an empty schema for `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Schema of a shadow (history) table, as produced by [`derive_shadow_schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSchema {
    /// Shadow table name.
    pub table: String,
    /// Live table the history belongs to.
    pub live_table: String,
    /// Fields copied verbatim between live rows and snapshots.
    pub fields: Vec<FieldDef>,
}

impl ShadowSchema {
    /// Names of the copied fields, in column order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// The fixed bookkeeping columns appended after the copied fields.
    #[must_use]
    pub const fn bookkeeping(&self) -> &'static [BookkeepingColumn] {
        &BOOKKEEPING_COLUMNS
    }

    /// Returns `true` if the shadow carries a copy of `name`.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// Derives the shadow schema of `live`.
///
/// Copies every field except relational links; the fixed
/// [`BOOKKEEPING_COLUMNS`] complete the shadow table.
///
/// # Errors
///
/// - [`VersioningError::SchemaConflict`] if a field uses a bookkeeping name,
///   or the live table name already carries [`SHADOW_SUFFIX`].
/// - [`VersioningError::InvalidSchema`] for malformed identifiers, duplicate
///   fields, or a field shadowing the live primary key.
pub fn derive_shadow_schema(live: &LiveSchema) -> Result<ShadowSchema> {
    validate_identifier(&live.table)?;
    if live.table.ends_with(SHADOW_SUFFIX) {
        return Err(VersioningError::conflict(
            &live.table,
            format!("live table names may not end with `{SHADOW_SUFFIX}`"),
        ));
    }

    let mut seen = HashSet::with_capacity(live.fields.len());
    for field in &live.fields {
        validate_identifier(&field.name)?;
        if is_bookkeeping_field(&field.name) {
            return Err(VersioningError::conflict(
                &live.table,
                format!("field `{}` is reserved for version bookkeeping", field.name),
            ));
        }
        if field.name == LIVE_PRIMARY_KEY {
            return Err(VersioningError::InvalidSchema(format!(
                "`{}.{LIVE_PRIMARY_KEY}` is the implicit primary key",
                live.table
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(VersioningError::InvalidSchema(format!(
                "duplicate field `{}.{}`",
                live.table, field.name
            )));
        }
        if let Some(link) = &field.link {
            validate_identifier(&link.table)?;
            validate_identifier(&link.column)?;
        }
    }

    Ok(ShadowSchema {
        table: shadow_table_name(&live.table),
        live_table: live.table.clone(),
        fields: live
            .fields
            .iter()
            .filter(|f| !f.is_link())
            .map(FieldDef::for_shadow)
            .collect(),
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::Value;

    fn person() -> LiveSchema {
        LiveSchema::new("person")
            .field(FieldDef::text("name"))
            .field(FieldDef::timestamp("birthday"))
            .field(FieldDef::boolean("is_relative").default_value(Value::from(true)))
    }

    #[test]
    fn shadow_copies_all_plain_fields() {
        let Ok(shadow) = derive_shadow_schema(&person()) else {
            panic!("derivation failed");
        };
        assert_eq!(shadow.table, "person_version");
        assert_eq!(shadow.live_table, "person");
        let names: Vec<&str> = shadow.field_names().collect();
        assert_eq!(names, ["name", "birthday", "is_relative"]);
        assert_eq!(shadow.bookkeeping().len(), 6);
        assert_eq!(
            shadow.fields.get(2).and_then(|f| f.default.clone()),
            Some(Value::from(true))
        );
    }

    #[test]
    fn shadow_drops_links() {
        let student = LiveSchema::new("student")
            .field(FieldDef::text("name"))
            .field(FieldDef::link("school_id", "school"));
        let Ok(shadow) = derive_shadow_schema(&student) else {
            panic!("derivation failed");
        };
        assert!(shadow.has_field("name"));
        assert!(!shadow.has_field("school_id"));
    }

    #[test]
    fn bookkeeping_collision_is_a_conflict() {
        for reserved in BOOKKEEPING_COLUMNS.iter().map(|c| c.name) {
            let schema = person().field(FieldDef::text(reserved));
            let result = derive_shadow_schema(&schema);
            assert!(
                matches!(result, Err(VersioningError::SchemaConflict { .. })),
                "`{reserved}` should be rejected"
            );
        }
    }

    #[test]
    fn suffixed_live_name_is_a_conflict() {
        let schema = LiveSchema::new("food_version").field(FieldDef::text("name"));
        assert!(matches!(
            derive_shadow_schema(&schema),
            Err(VersioningError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn duplicate_and_malformed_fields_are_invalid() {
        let dup = person().field(FieldDef::text("name"));
        assert!(matches!(
            derive_shadow_schema(&dup),
            Err(VersioningError::InvalidSchema(_))
        ));

        let bad = person().field(FieldDef::text("drop table"));
        assert!(matches!(
            derive_shadow_schema(&bad),
            Err(VersioningError::InvalidSchema(_))
        ));

        let pk = person().field(FieldDef::integer("id"));
        assert!(matches!(
            derive_shadow_schema(&pk),
            Err(VersioningError::InvalidSchema(_))
        ));
    }

    #[test]
    fn naming_is_reversible() {
        let shadow = shadow_table_name("food");
        assert_eq!(shadow, "food_version");
        assert_eq!(live_table_name_of(&shadow), Some("food"));
        assert_eq!(live_table_name_of("food"), None);
        assert_eq!(live_table_name_of(SHADOW_SUFFIX), None);
    }
}
