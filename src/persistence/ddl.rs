//! Raw schema changes against a single table.
//!
//! [`SchemaEditor::run`] applies exactly the operation it is given to
//! exactly the table it names; keeping shadow tables in step is the
//! migration propagator's job. Changes SQLite cannot express with
//! `ALTER TABLE` go through the table rebuild procedure, which requires
//! `PRAGMA foreign_keys = OFF` on the connection.

use sqlx::{Row, SqliteConnection};

use super::introspect::{ColumnInfo, TableInfo, introspect_table};
use super::sql::{column_definition, ident, ident_list};
use crate::domain::schema::validate_identifier;
use crate::domain::SchemaOperation;
use crate::error::{Result, VersioningError};

const REBUILD_PREFIX: &str = "_rebuild_";

/// Name given to an index created by [`SchemaOperation::AddIndex`].
#[must_use]
pub fn index_name(table: &str, columns: &[String]) -> String {
    format!("{table}_{}", columns.join("_"))
}

/// Applies schema operations to one table at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaEditor;

impl SchemaEditor {
    /// Applies `op` to the table it names.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::InvalidSchema`] for unknown tables or
    /// columns and bad identifiers, [`VersioningError::Storage`] when the
    /// store rejects the change (e.g. `NOT NULL` over existing nulls).
    pub async fn run(conn: &mut SqliteConnection, op: &SchemaOperation) -> Result<()> {
        tracing::debug!(operation = %op, "applying schema operation");
        match op {
            SchemaOperation::AddColumn { table, field } => {
                validate_identifier(&field.name)?;
                let mut plain = field.clone();
                plain.unique = false;
                execute(
                    conn,
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        ident(table),
                        column_definition(&plain)
                    ),
                )
                .await?;
                if field.unique {
                    let columns = [field.name.clone()];
                    create_index(conn, table, &columns, true).await?;
                }
                Ok(())
            }
            SchemaOperation::DropColumn { table, column } => {
                let info = require_column(conn, table, column).await?;
                if info.column(column).is_some_and(|c| c.primary_key) {
                    return Err(VersioningError::InvalidSchema(format!(
                        "cannot drop key column `{table}.{column}`"
                    )));
                }
                if info.is_constrained(column) {
                    rebuild(conn, info, |columns| columns.retain(|c| c.name != *column)).await
                } else {
                    execute(
                        conn,
                        &format!("ALTER TABLE {} DROP COLUMN {}", ident(table), ident(column)),
                    )
                    .await
                }
            }
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => {
                validate_identifier(new_name)?;
                execute(
                    conn,
                    &format!(
                        "ALTER TABLE {} RENAME COLUMN {} TO {}",
                        ident(table),
                        ident(old_name),
                        ident(new_name)
                    ),
                )
                .await
            }
            SchemaOperation::AddNotNull { table, column } => {
                set_not_null(conn, table, column, true).await
            }
            SchemaOperation::DropNotNull { table, column } => {
                set_not_null(conn, table, column, false).await
            }
            SchemaOperation::RenameTable { old_name, new_name } => {
                validate_identifier(new_name)?;
                execute(
                    conn,
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        ident(old_name),
                        ident(new_name)
                    ),
                )
                .await
            }
            SchemaOperation::AddIndex {
                table,
                columns,
                unique,
            } => create_index(conn, table, columns, *unique).await,
            SchemaOperation::DropIndex { index_name, .. } => {
                execute(conn, &format!("DROP INDEX {}", ident(index_name))).await
            }
        }
    }
}

async fn execute(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    sqlx::query(sql).execute(&mut *conn).await?;
    Ok(())
}

async fn create_index(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[String],
    unique: bool,
) -> Result<()> {
    if columns.is_empty() {
        return Err(VersioningError::InvalidSchema(format!(
            "index on `{table}` needs at least one column"
        )));
    }
    let sql = format!(
        "CREATE {}INDEX {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        ident(&index_name(table, columns)),
        ident(table),
        ident_list(columns.iter().map(String::as_str))
    );
    execute(conn, &sql).await
}

async fn require_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<TableInfo> {
    let Some(info) = introspect_table(conn, table).await? else {
        return Err(VersioningError::InvalidSchema(format!(
            "table `{table}` does not exist"
        )));
    };
    if info.column(column).is_none() {
        return Err(VersioningError::InvalidSchema(format!(
            "column `{table}.{column}` does not exist"
        )));
    }
    Ok(info)
}

async fn set_not_null(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    not_null: bool,
) -> Result<()> {
    let info = require_column(conn, table, column).await?;
    rebuild(conn, info, |columns| {
        for c in columns.iter_mut().filter(|c| c.name == column) {
            c.not_null = not_null;
        }
    })
    .await
}

fn rebuilt_column_definition(column: &ColumnInfo, inline_key: bool, autoincrement: bool) -> String {
    let mut sql = ident(&column.name);
    if !column.decl_type.is_empty() {
        sql.push(' ');
        sql.push_str(&column.decl_type);
    }
    if inline_key {
        sql.push_str(" PRIMARY KEY");
        if autoincrement {
            sql.push_str(" AUTOINCREMENT");
        }
    }
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_sql {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

/// `CREATE TABLE` for `info` under the name `table`, keeping only the
/// constraints whose columns all survive.
fn rebuilt_table_sql(info: &TableInfo, table: &str) -> String {
    let keep = |column: &str| info.column(column).is_some();
    let key = info.primary_key_column();
    let mut parts: Vec<String> = info
        .columns
        .iter()
        .map(|c| rebuilt_column_definition(c, key == Some(c.name.as_str()), info.autoincrement))
        .collect();

    let composite_key: Vec<&str> = info
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if key.is_none() && !composite_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", ident_list(composite_key)));
    }

    for index in info.indexes.iter().filter(|i| i.origin == "u") {
        if index.columns.iter().all(|c| keep(c)) {
            parts.push(format!(
                "UNIQUE ({})",
                ident_list(index.columns.iter().map(String::as_str))
            ));
        }
    }
    for fk in info.foreign_keys.iter().filter(|fk| keep(&fk.column)) {
        let target = fk
            .to
            .as_deref()
            .map(|to| format!(" ({})", ident(to)))
            .unwrap_or_default();
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}{target}",
            ident(&fk.column),
            ident(&fk.table)
        ));
    }

    format!("CREATE TABLE {} ({})", ident(table), parts.join(", "))
}

/// Rebuilds `target.name` with its column list adjusted by `adjust`.
///
/// Rows, explicit indexes on surviving columns and the `AUTOINCREMENT`
/// counter are carried over.
async fn rebuild(
    conn: &mut SqliteConnection,
    mut target: TableInfo,
    adjust: impl FnOnce(&mut Vec<ColumnInfo>),
) -> Result<()> {
    let table = target.name.clone();
    let temp = format!("{REBUILD_PREFIX}{table}");
    adjust(&mut target.columns);
    let copied: Vec<&str> = target.columns.iter().map(|c| c.name.as_str()).collect();

    tracing::debug!(table = %table, "rebuilding table");
    execute(conn, &rebuilt_table_sql(&target, &temp)).await?;
    execute(
        conn,
        &format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
            ident(&temp),
            ident(&table),
            cols = ident_list(copied.iter().copied())
        ),
    )
    .await?;

    let sequence: Option<i64> = if target.autoincrement {
        sqlx::query("SELECT seq FROM sqlite_sequence WHERE name = ?")
            .bind(&table)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.try_get::<i64, _>("seq"))
            .transpose()?
    } else {
        None
    };

    execute(conn, &format!("DROP TABLE {}", ident(&table))).await?;
    execute(
        conn,
        &format!("ALTER TABLE {} RENAME TO {}", ident(&temp), ident(&table)),
    )
    .await?;

    if let Some(seq) = sequence {
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = ?")
            .bind(&table)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)")
            .bind(&table)
            .bind(seq)
            .execute(&mut *conn)
            .await?;
    }

    for index in target.indexes.iter().filter(|i| i.is_explicit()) {
        let Some(sql) = &index.sql else {
            continue;
        };
        if index.columns.iter().all(|c| copied.contains(&c.as_str())) {
            execute(conn, sql).await?;
        }
    }
    Ok(())
}
