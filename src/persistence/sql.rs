//! SQL text rendering and dynamic value binding for SQLite.
//!
//! Identifiers are always double-quoted through [`ident`]; values are always
//! bound as parameters, never interpolated (DDL defaults excepted, which go
//! through [`Value::to_sql_literal`]).

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

use crate::domain::schema::{BookkeepingColumn, LIVE_PRIMARY_KEY};
use crate::domain::{FieldDef, FieldKind, LiveSchema, ShadowSchema, Value};

/// A SQLite query with positional arguments.
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Quotes an identifier.
#[must_use]
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated quoted identifiers.
#[must_use]
pub fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(ident).collect::<Vec<_>>().join(", ")
}

/// `?, ?, ?` with `n` placeholders.
#[must_use]
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Column definition used in `CREATE TABLE` and `ADD COLUMN`.
#[must_use]
pub fn column_definition(field: &FieldDef) -> String {
    let mut sql = format!("{} {}", ident(&field.name), field.kind.sql_type());
    if !field.nullable {
        sql.push_str(" NOT NULL");
    }
    if field.unique {
        sql.push_str(" UNIQUE");
    }
    if let Some(default) = &field.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default.to_sql_literal());
    }
    if let Some(link) = &field.link {
        sql.push_str(&format!(
            " REFERENCES {} ({})",
            ident(&link.table),
            ident(&link.column)
        ));
    }
    sql
}

fn bookkeeping_definition(column: &BookkeepingColumn) -> String {
    let mut sql = format!("{} {}", ident(column.name), column.kind.sql_type());
    if column.primary_key {
        sql.push_str(" PRIMARY KEY AUTOINCREMENT");
        return sql;
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = column.default_expr {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

/// `CREATE TABLE` statement for a live table.
///
/// The key is `AUTOINCREMENT` so the id of a deleted record, still held by
/// its tombstone, is never handed out again.
#[must_use]
pub fn create_live_table(schema: &LiveSchema) -> String {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        ident(LIVE_PRIMARY_KEY)
    )];
    columns.extend(schema.fields.iter().map(column_definition));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        ident(&schema.table),
        columns.join(", ")
    )
}

/// `CREATE TABLE` statement for a shadow table: primary key, copied fields,
/// then the remaining bookkeeping columns.
#[must_use]
pub fn create_shadow_table(shadow: &ShadowSchema) -> String {
    let bookkeeping = shadow.bookkeeping();
    let columns: Vec<String> = bookkeeping
        .iter()
        .filter(|c| c.primary_key)
        .map(bookkeeping_definition)
        .chain(shadow.fields.iter().map(column_definition))
        .chain(
            bookkeeping
                .iter()
                .filter(|c| !c.primary_key)
                .map(bookkeeping_definition),
        )
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        ident(&shadow.table),
        columns.join(", ")
    )
}

/// Name of the index on a shadow bookkeeping column.
#[must_use]
pub fn shadow_index_name(shadow_table: &str, column: &str) -> String {
    format!("{shadow_table}_{column}")
}

/// Bookkeeping columns of a shadow table that carry an index.
pub fn indexed_bookkeeping_columns(shadow: &ShadowSchema) -> impl Iterator<Item = &'static str> {
    shadow
        .bookkeeping()
        .iter()
        .filter(|c| c.indexed)
        .map(|c| c.name)
}

/// `CREATE INDEX` statements for the indexed bookkeeping columns of the
/// shadow table named `shadow_table`.
#[must_use]
pub fn create_shadow_indexes(shadow_table: &str, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .map(|column| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                ident(&shadow_index_name(shadow_table, column)),
                ident(shadow_table),
                ident(column)
            )
        })
        .collect()
}

/// Binds a dynamic value as the next positional argument.
#[must_use]
pub fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Boolean(v) => query.bind(*v),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
    }
}

/// Decodes column `column` of `row` as a value of `kind`.
///
/// # Errors
///
/// Returns the driver's decode error if the stored value does not fit `kind`.
pub fn decode_value(row: &SqliteRow, column: &str, kind: FieldKind) -> Result<Value, sqlx::Error> {
    let value = match kind {
        FieldKind::Integer => row
            .try_get_unchecked::<Option<i64>, _>(column)?
            .map_or(Value::Null, Value::Integer),
        FieldKind::Real => row
            .try_get_unchecked::<Option<f64>, _>(column)?
            .map_or(Value::Null, Value::Real),
        FieldKind::Text => row
            .try_get_unchecked::<Option<String>, _>(column)?
            .map_or(Value::Null, Value::Text),
        FieldKind::Boolean => row
            .try_get_unchecked::<Option<bool>, _>(column)?
            .map_or(Value::Null, Value::Boolean),
        FieldKind::Timestamp => row
            .try_get_unchecked::<Option<DateTime<Utc>>, _>(column)?
            .map_or(Value::Null, Value::Timestamp),
    };
    Ok(value)
}
