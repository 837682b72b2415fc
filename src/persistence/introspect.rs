//! Schema introspection over SQLite's `pragma_*` table-valued functions.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{Row, SqliteConnection};

use crate::error::Result;

/// One column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim.
    pub decl_type: String,
    /// `NOT NULL` constraint.
    pub not_null: bool,
    /// Default expression as SQL text.
    pub default_sql: Option<String>,
    /// Part of the primary key.
    pub primary_key: bool,
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyInfo {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub table: String,
    /// Referenced column; `None` means the referenced table's key.
    pub to: Option<String>,
}

/// An index, explicit or automatic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// `c` for `CREATE INDEX`, `u` for a `UNIQUE` constraint, `pk` for the key.
    pub origin: String,
    /// Creating statement; `None` for automatic indexes.
    pub sql: Option<String>,
}

impl IndexInfo {
    /// Whether the index was created by `CREATE INDEX`.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.origin == "c"
    }

    /// Whether the index covers `column`.
    #[must_use]
    pub fn covers(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Everything the DDL layer needs to know about one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnInfo>,
    /// Foreign keys.
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Indexes.
    pub indexes: Vec<IndexInfo>,
    /// Whether the key was declared `AUTOINCREMENT`.
    pub autoincrement: bool,
}

impl TableInfo {
    /// Column named `name`.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The single primary-key column, if the key is not composite.
    #[must_use]
    pub fn primary_key_column(&self) -> Option<&str> {
        let mut keys = self.columns.iter().filter(|c| c.primary_key);
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key.name.as_str()),
            _ => None,
        }
    }

    /// Whether `column` takes part in a foreign key or an index.
    #[must_use]
    pub fn is_constrained(&self, column: &str) -> bool {
        self.foreign_keys.iter().any(|fk| fk.column == column)
            || self.indexes.iter().any(|idx| idx.covers(column))
    }
}

/// Introspects `table`; `None` if it does not exist.
///
/// # Errors
///
/// Returns [`crate::error::VersioningError::Storage`] on driver failure.
pub async fn introspect_table(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<TableInfo>> {
    let create_sql: Option<String> =
        sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(create_sql) = create_sql else {
        return Ok(None);
    };

    let columns = sqlx::query(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|row| {
        Ok(ColumnInfo {
            name: row.try_get("name")?,
            decl_type: row.try_get("type")?,
            not_null: row.try_get::<i64, _>("notnull")? != 0,
            default_sql: row.try_get("dflt_value")?,
            primary_key: row.try_get::<i64, _>("pk")? != 0,
        })
    })
    .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

    let foreign_keys = sqlx::query("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| {
            Ok(ForeignKeyInfo {
                column: row.try_get("from")?,
                table: row.try_get("table")?,
                to: row.try_get("to")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

    let listed = sqlx::query("SELECT name, \"unique\", origin FROM pragma_index_list(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    let mut indexes = Vec::with_capacity(listed.len());
    for row in &listed {
        let name: String = row.try_get("name")?;
        // Expression columns have no name and are left out.
        let columns = sqlx::query_scalar::<_, Option<String>>(
            "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
        )
        .bind(&name)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .flatten()
        .collect();
        let sql = sqlx::query_scalar::<_, Option<String>>(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?",
        )
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?
        .flatten();
        indexes.push(IndexInfo {
            name,
            columns,
            unique: row.try_get::<i64, _>("unique")? != 0,
            origin: row.try_get("origin")?,
            sql,
        });
    }

    Ok(Some(TableInfo {
        name: table.to_string(),
        columns,
        foreign_keys,
        indexes,
        autoincrement: create_sql.to_ascii_uppercase().contains("AUTOINCREMENT"),
    }))
}

/// Per-batch cache of table → column names.
///
/// Filled by one introspection query and kept until
/// [`SchemaCatalog::invalidate`]; callers drop it after any statement that
/// changes columns or table names.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    tables: Option<BTreeMap<String, BTreeSet<String>>>,
    introspections: usize,
}

impl SchemaCatalog {
    /// An empty, unloaded catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog preloaded with `tables`, for planning without a store.
    #[must_use]
    pub fn from_tables<'a>(
        tables: impl IntoIterator<Item = (&'a str, &'a [&'a str])>,
    ) -> Self {
        let tables = tables
            .into_iter()
            .map(|(table, columns)| {
                let columns = columns.iter().map(|c| (*c).to_string()).collect();
                (table.to_string(), columns)
            })
            .collect();
        Self {
            tables: Some(tables),
            introspections: 0,
        }
    }

    /// Loads the catalog if it is not loaded.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VersioningError::Storage`] on driver failure.
    pub async fn ensure_loaded(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        if self.tables.is_some() {
            return Ok(());
        }
        let rows = sqlx::query(
            "SELECT m.name AS table_name, p.name AS column_name \
             FROM sqlite_master AS m JOIN pragma_table_info(m.name) AS p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            tables.entry(table).or_default().insert(column);
        }
        self.introspections = self.introspections.saturating_add(1);
        tracing::debug!(tables = tables.len(), "schema catalog loaded");
        self.tables = Some(tables);
        Ok(())
    }

    /// Forgets the cached schema; the next lookup reloads it.
    pub fn invalidate(&mut self) {
        self.tables = None;
    }

    /// Whether the cache currently holds a schema.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.tables.is_some()
    }

    /// How many times the store has been introspected.
    #[must_use]
    pub const fn introspections(&self) -> usize {
        self.introspections
    }

    /// Whether `table` exists.
    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.columns(table).is_some()
    }

    /// Whether `table` has a column named `column`.
    #[must_use]
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table).is_some_and(|c| c.contains(column))
    }

    /// Column names of `table`.
    #[must_use]
    pub fn columns(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.tables.as_ref().and_then(|t| t.get(table))
    }
}
