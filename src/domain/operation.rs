//! Schema-change operations understood by the migration propagator.
//!
//! The set is closed: every operation the propagator can mirror is a
//! variant here, with typed arguments, and plans serialize as tagged JSON:
//!
//! ```json
//! [
//!   { "op": "add_column", "table": "food", "field": { "name": "note", "kind": "text", "nullable": true } },
//!   { "op": "rename_table", "old_name": "food", "new_name": "chow" }
//! ]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FieldDef;
use crate::error::Result;

/// A single schema change against a live table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    /// Add a column.
    AddColumn {
        /// Target table.
        table: String,
        /// Column definition.
        field: FieldDef,
    },
    /// Drop a column.
    DropColumn {
        /// Target table.
        table: String,
        /// Column to drop.
        column: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Target table.
        table: String,
        /// Current column name.
        old_name: String,
        /// New column name.
        new_name: String,
    },
    /// Make a column `NOT NULL`.
    AddNotNull {
        /// Target table.
        table: String,
        /// Column to constrain.
        column: String,
    },
    /// Allow `NULL` in a column.
    DropNotNull {
        /// Target table.
        table: String,
        /// Column to relax.
        column: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current table name.
        old_name: String,
        /// New table name.
        new_name: String,
    },
    /// Create an index.
    AddIndex {
        /// Target table.
        table: String,
        /// Indexed columns, in order.
        columns: Vec<String>,
        /// Whether the index enforces uniqueness.
        #[serde(default)]
        unique: bool,
    },
    /// Drop an index by name.
    DropIndex {
        /// Table the index belongs to.
        table: String,
        /// Index name.
        index_name: String,
    },
}

impl SchemaOperation {
    /// The table the operation is issued against (the old name for renames).
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::RenameColumn { table, .. }
            | Self::AddNotNull { table, .. }
            | Self::DropNotNull { table, .. }
            | Self::AddIndex { table, .. }
            | Self::DropIndex { table, .. } => table,
            Self::RenameTable { old_name, .. } => old_name,
        }
    }

    /// Short snake_case name of the operation.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddColumn { .. } => "add_column",
            Self::DropColumn { .. } => "drop_column",
            Self::RenameColumn { .. } => "rename_column",
            Self::AddNotNull { .. } => "add_not_null",
            Self::DropNotNull { .. } => "drop_not_null",
            Self::RenameTable { .. } => "rename_table",
            Self::AddIndex { .. } => "add_index",
            Self::DropIndex { .. } => "drop_index",
        }
    }

    /// Whether the operation removes or restricts existing schema, so that
    /// a shadow mirror has to run before it.
    #[must_use]
    pub const fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::DropColumn { .. }
                | Self::RenameColumn { .. }
                | Self::AddNotNull { .. }
                | Self::RenameTable { .. }
        )
    }

    /// Whether the operation changes column sets or table names.
    #[must_use]
    pub const fn changes_columns(&self) -> bool {
        !matches!(self, Self::AddIndex { .. } | Self::DropIndex { .. })
    }

    /// The same operation issued against another table.
    #[must_use]
    pub fn retarget(&self, target: &str) -> Self {
        let mut op = self.clone();
        match &mut op {
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::RenameColumn { table, .. }
            | Self::AddNotNull { table, .. }
            | Self::DropNotNull { table, .. }
            | Self::AddIndex { table, .. }
            | Self::DropIndex { table, .. }
            | Self::RenameTable {
                old_name: table, ..
            } => *table = target.to_string(),
        }
        op
    }

    /// Parses a JSON migration plan (an array of tagged operations).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VersioningError::InvalidPlan`] on malformed JSON.
    pub fn parse_plan(json: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumn { table, field } => write!(f, "add_column {table}.{}", field.name),
            Self::DropColumn { table, column } => write!(f, "drop_column {table}.{column}"),
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => write!(f, "rename_column {table}.{old_name} -> {new_name}"),
            Self::AddNotNull { table, column } => write!(f, "add_not_null {table}.{column}"),
            Self::DropNotNull { table, column } => write!(f, "drop_not_null {table}.{column}"),
            Self::RenameTable { old_name, new_name } => {
                write!(f, "rename_table {old_name} -> {new_name}")
            }
            Self::AddIndex { table, columns, .. } => {
                write!(f, "add_index {table}({})", columns.join(", "))
            }
            Self::DropIndex { table, index_name } => write!(f, "drop_index {table}.{index_name}"),
        }
    }
}
