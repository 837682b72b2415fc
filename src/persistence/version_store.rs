//! Snapshot CRUD against one shadow table.
//!
//! Every method takes the connection explicitly so callers decide the
//! transaction scope; the store itself never begins or commits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::sql::{bind_value, decode_value, ident, ident_list, placeholders};
use crate::domain::schema::{
    DELETED, ORIGINAL_RECORD_ID, SNAPSHOT_ID, VALID_FROM, VALID_UNTIL, VERSION_NUMBER,
};
use crate::domain::{RecordId, ShadowSchema, Snapshot, Value};
use crate::error::{Result, VersioningError};

/// Snapshot operations for the shadow table described by a [`ShadowSchema`].
#[derive(Debug, Clone, Copy)]
pub struct VersionStore<'a> {
    shadow: &'a ShadowSchema,
}

impl<'a> VersionStore<'a> {
    /// Creates a store over `shadow`.
    #[must_use]
    pub const fn new(shadow: &'a ShadowSchema) -> Self {
        Self { shadow }
    }

    /// `SELECT <all columns> FROM <shadow> WHERE original_record_id = ? <tail>`
    fn select_sql(&self, tail: &str) -> String {
        let bookkeeping = [
            SNAPSHOT_ID,
            ORIGINAL_RECORD_ID,
            VERSION_NUMBER,
            VALID_FROM,
            VALID_UNTIL,
            DELETED,
        ];
        format!(
            "SELECT {} FROM {} WHERE {} = ? {tail}",
            ident_list(bookkeeping.into_iter().chain(self.shadow.field_names())),
            ident(&self.shadow.table),
            ident(ORIGINAL_RECORD_ID),
        )
    }

    fn decode(&self, row: &SqliteRow) -> Result<Snapshot> {
        let mut fields = BTreeMap::new();
        for field in &self.shadow.fields {
            fields.insert(field.name.clone(), decode_value(row, &field.name, field.kind)?);
        }
        Ok(Snapshot {
            snapshot_id: row.try_get_unchecked(SNAPSHOT_ID)?,
            record_id: RecordId::new(row.try_get_unchecked(ORIGINAL_RECORD_ID)?),
            version_number: row.try_get_unchecked(VERSION_NUMBER)?,
            valid_from: row.try_get_unchecked(VALID_FROM)?,
            valid_until: row.try_get_unchecked(VALID_UNTIL)?,
            deleted: row.try_get_unchecked(DELETED)?,
            fields,
        })
    }

    async fn fetch(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
        tail: &str,
        extra: &[i64],
    ) -> Result<Vec<Snapshot>> {
        let sql = self.select_sql(tail);
        let mut query = sqlx::query(&sql).bind(record_id.get());
        for value in extra {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Inserts a snapshot of `fields` as `version_number` of `record_id`.
    ///
    /// The snapshot is open unless it is a tombstone; tombstones are written
    /// already closed at `at`, so no record is ever left without its final
    /// state recorded nor with a dangling open snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on constraint violation or any
    /// other driver failure.
    pub async fn insert_snapshot(
        &self,
        conn: &mut SqliteConnection,
        fields: &BTreeMap<String, Value>,
        version_number: i64,
        record_id: RecordId,
        deleted: bool,
        at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let valid_until = deleted.then_some(at);
        let columns: Vec<&str> = self
            .shadow
            .field_names()
            .chain([ORIGINAL_RECORD_ID, VERSION_NUMBER, VALID_FROM, VALID_UNTIL, DELETED])
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            ident(&self.shadow.table),
            ident_list(columns.iter().copied()),
            placeholders(columns.len()),
        );

        let copied: BTreeMap<String, Value> = self
            .shadow
            .field_names()
            .map(|name| {
                let value = fields.get(name).cloned().unwrap_or(Value::Null);
                (name.to_string(), value)
            })
            .collect();

        let mut query = sqlx::query(&sql);
        for name in self.shadow.field_names() {
            query = bind_value(query, copied.get(name).unwrap_or(&Value::Null));
        }
        let result = query
            .bind(record_id.get())
            .bind(version_number)
            .bind(at)
            .bind(valid_until)
            .bind(deleted)
            .execute(&mut *conn)
            .await?;

        Ok(Snapshot {
            snapshot_id: result.last_insert_rowid(),
            record_id,
            version_number,
            valid_from: at,
            valid_until,
            deleted,
            fields: copied,
        })
    }

    /// Finds the open snapshot of `record_id`.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::ConsistencyViolation`] if more than one
    /// snapshot is open; the history is corrupt and nothing is repaired.
    pub async fn find_open_snapshot(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
    ) -> Result<Option<Snapshot>> {
        let tail = format!("AND {} IS NULL", ident(VALID_UNTIL));
        let mut open = self.fetch(conn, record_id, &tail, &[]).await?;
        if open.len() > 1 {
            return Err(VersioningError::ConsistencyViolation {
                table: self.shadow.table.clone(),
                record_id,
                open_count: open.len(),
            });
        }
        Ok(open.pop())
    }

    /// Finds version `n` of `record_id`.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn find_by_version_number(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
        n: i64,
    ) -> Result<Option<Snapshot>> {
        let tail = format!("AND {} = ?", ident(VERSION_NUMBER));
        let mut found = self.fetch(conn, record_id, &tail, &[n]).await?;
        Ok(found.pop())
    }

    /// Finds a closed snapshot by offset from the current version.
    ///
    /// Closed snapshots are ranked most recent first. Offsets `0` and `-1`
    /// both select the newest closed snapshot (the version right before the
    /// open one); `-n` selects the `n`-th newest. Positive offsets and
    /// offsets past the start of history yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn find_by_relative_offset(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
        k: i64,
    ) -> Result<Option<Snapshot>> {
        if k > 0 {
            return Ok(None);
        }
        let skip = i64::try_from(k.unsigned_abs().saturating_sub(1)).unwrap_or(i64::MAX);
        let tail = format!(
            "AND {} IS NOT NULL ORDER BY {} DESC LIMIT 1 OFFSET ?",
            ident(VALID_UNTIL),
            ident(VERSION_NUMBER)
        );
        let mut found = self.fetch(conn, record_id, &tail, &[skip]).await?;
        Ok(found.pop())
    }

    /// Closes `snapshot` at `closed_at`, returning the closed copy.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::AlreadyClosed`] if the snapshot (in memory
    /// or in the store) is already closed.
    pub async fn close_snapshot(
        &self,
        conn: &mut SqliteConnection,
        snapshot: &Snapshot,
        closed_at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let already_closed = || VersioningError::AlreadyClosed {
            table: self.shadow.table.clone(),
            snapshot_id: snapshot.snapshot_id,
        };
        if !snapshot.is_open() {
            return Err(already_closed());
        }

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ? AND {} IS NULL",
            ident(&self.shadow.table),
            ident(VALID_UNTIL),
            ident(SNAPSHOT_ID),
            ident(VALID_UNTIL),
        );
        let result = sqlx::query(&sql)
            .bind(closed_at)
            .bind(snapshot.snapshot_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(already_closed());
        }

        Ok(Snapshot {
            valid_until: Some(closed_at),
            ..snapshot.clone()
        })
    }

    /// One more than the highest version of `record_id`, or 1.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn next_version_number(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
    ) -> Result<i64> {
        let sql = format!(
            "SELECT MAX({}) FROM {} WHERE {} = ?",
            ident(VERSION_NUMBER),
            ident(&self.shadow.table),
            ident(ORIGINAL_RECORD_ID),
        );
        let max: Option<i64> = sqlx::query_scalar(&sql)
            .bind(record_id.get())
            .fetch_one(&mut *conn)
            .await?;
        Ok(max.map_or(1, |v| v.saturating_add(1)))
    }

    /// All snapshots of `record_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn list_snapshots(
        &self,
        conn: &mut SqliteConnection,
        record_id: RecordId,
    ) -> Result<Vec<Snapshot>> {
        let tail = format!("ORDER BY {} ASC", ident(VERSION_NUMBER));
        self.fetch(conn, record_id, &tail, &[]).await
    }
}
