//! User-declared field definitions.

use serde::{Deserialize, Serialize};

use super::{FieldKind, Value};

/// Target of a relational link (foreign key) field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Referenced table.
    pub table: String,
    /// Referenced column, usually the target's primary key.
    pub column: String,
}

/// Definition of one column of a live table.
///
/// Built with the kind-specific constructors and refined with the
/// chaining modifiers:
///
/// ```
/// use versioned_rows::domain::{FieldDef, Value};
///
/// let name = FieldDef::text("name").nullable();
/// let tasty = FieldDef::boolean("is_tasty").default_value(Value::from(false));
/// let menu = FieldDef::link("menu_id", "menu");
/// assert!(menu.is_link());
/// assert!(!name.is_link() && !tasty.nullable);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name.
    pub name: String,
    /// Storage kind.
    pub kind: FieldKind,
    /// Whether the column accepts `NULL`.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column carries a `UNIQUE` constraint.
    #[serde(default)]
    pub unique: bool,
    /// Column default, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Relational link target, if this field is a foreign key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkTarget>,
}

impl FieldDef {
    /// A non-null field of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            unique: false,
            default: None,
            link: None,
        }
    }

    /// A text field.
    #[must_use]
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// An integer field.
    #[must_use]
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    /// A floating point field.
    #[must_use]
    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Real)
    }

    /// A boolean field.
    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    /// A timestamp field.
    #[must_use]
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Timestamp)
    }

    /// A nullable integer field referencing `table(id)`.
    ///
    /// Link fields stay nullable so they can be added to populated tables.
    #[must_use]
    pub fn link(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            nullable: true,
            link: Some(LinkTarget {
                table: table.into(),
                column: "id".to_string(),
            }),
            ..Self::new(name, FieldKind::Integer)
        }
    }

    /// Marks the field nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the field unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the column default.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Returns `true` if this field is a relational link to another table.
    #[must_use]
    pub const fn is_link(&self) -> bool {
        self.link.is_some()
    }

    /// The copy of this field carried by a shadow table: same kind,
    /// nullability and default, without uniqueness or link.
    #[must_use]
    pub fn for_shadow(&self) -> Self {
        Self {
            unique: false,
            link: None,
            ..self.clone()
        }
    }
}
