//! Record lifecycle over a live table and its shadow table.
//!
//! [`VersionedTable`] is the entry point: it saves, deletes and reverts
//! [`Record`]s, writing a snapshot for every change. Each mutation runs in
//! one transaction; the `*_in` variants run on a caller-supplied
//! connection so several mutations can share one transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{SqliteConnection, SqlitePool};

use crate::domain::schema::LIVE_PRIMARY_KEY;
use crate::domain::{
    LiveSchema, Record, RecordId, RecordState, RevertTarget, ShadowSchema, Snapshot, Value,
    derive_shadow_schema,
};
use crate::error::{Result, VersioningError};
use crate::persistence::sql::{
    self, bind_value, decode_value, ident, ident_list, placeholders,
};
use crate::persistence::version_store::VersionStore;

/// What a save did to the record's history.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The live row was inserted and version 1 written.
    Created(Snapshot),
    /// The live row changed; the previous snapshot (if any) was closed and
    /// this one appended.
    Versioned(Snapshot),
    /// No field changed. The live row was rewritten, history untouched.
    Unchanged,
}

impl SaveOutcome {
    /// The snapshot written by the save, if any.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Created(s) | Self::Versioned(s) => Some(s),
            Self::Unchanged => None,
        }
    }
}

/// A versioned live table.
///
/// Holds the live schema and the shadow schema derived from it once at
/// construction; every snapshot copies exactly the shadow field list.
#[derive(Debug, Clone)]
pub struct VersionedTable {
    pool: SqlitePool,
    live: LiveSchema,
    shadow: ShadowSchema,
}

impl VersionedTable {
    /// Registers `live` on `pool`, deriving its shadow schema.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::SchemaConflict`] or
    /// [`VersioningError::InvalidSchema`] if the schema cannot be versioned.
    pub fn new(pool: SqlitePool, live: LiveSchema) -> Result<Self> {
        let shadow = derive_shadow_schema(&live)?;
        Ok(Self { pool, live, shadow })
    }

    /// The live table schema.
    #[must_use]
    pub const fn live_schema(&self) -> &LiveSchema {
        &self.live
    }

    /// The derived shadow table schema.
    #[must_use]
    pub const fn shadow_schema(&self) -> &ShadowSchema {
        &self.shadow
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn store(&self) -> VersionStore<'_> {
        VersionStore::new(&self.shadow)
    }

    /// Creates the live table, the shadow table and its indexes, skipping
    /// whatever already exists.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on failure; nothing is created.
    pub async fn create_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql::create_live_table(&self.live))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&sql::create_shadow_table(&self.shadow))
            .execute(&mut *tx)
            .await?;
        let indexed: Vec<&str> = sql::indexed_bookkeeping_columns(&self.shadow).collect();
        for statement in sql::create_shadow_indexes(&self.shadow.table, &indexed) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!(table = %self.live.table, shadow = %self.shadow.table, "schema created");
        Ok(())
    }

    /// Drops the shadow table and the live table, if they exist.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on failure, e.g. when another
    /// table still references the live table.
    pub async fn drop_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [&self.shadow.table, &self.live.table] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", ident(table)))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(table = %self.live.table, "schema dropped");
        Ok(())
    }

    /// Loads record `id`.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::RecordNotFound`] if there is no such row.
    pub async fn get(&self, id: RecordId) -> Result<Record> {
        let mut conn = self.pool.acquire().await?;
        let values = self
            .read_row(&mut conn, id)
            .await?
            .ok_or(VersioningError::RecordNotFound(id))?;
        let mut record = Record::new();
        record.mark_persisted(id, values);
        Ok(record)
    }

    /// All snapshots of record `id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn history(&self, id: RecordId) -> Result<Vec<Snapshot>> {
        let mut conn = self.pool.acquire().await?;
        self.store().list_snapshots(&mut conn, id).await
    }

    /// Version `n` of record `id`.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Storage`] on driver failure.
    pub async fn snapshot_at(&self, id: RecordId, n: i64) -> Result<Option<Snapshot>> {
        let mut conn = self.pool.acquire().await?;
        self.store().find_by_version_number(&mut conn, id, n).await
    }

    /// Version number of the record's open snapshot; `None` for transient
    /// records and records without history.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::ConsistencyViolation`] if the history has
    /// more than one open snapshot.
    pub async fn current_version_id(&self, record: &Record) -> Result<Option<i64>> {
        let Some(id) = record.id() else {
            return Ok(None);
        };
        let mut conn = self.pool.acquire().await?;
        let open = self.store().find_open_snapshot(&mut conn, id).await?;
        Ok(open.map(|s| s.version_number))
    }

    /// Saves `record` in its own transaction.
    ///
    /// # Errors
    ///
    /// Any failure rolls the transaction back and leaves `record` as the
    /// caller set it.
    pub async fn save(&self, record: &mut Record) -> Result<SaveOutcome> {
        let mut tx = self.pool.begin().await?;
        let (outcome, id, values) = self.write(&mut tx, record, Utc::now(), false).await?;
        tx.commit().await?;
        record.mark_persisted(id, values);
        Ok(outcome)
    }

    /// Saves `record` on `conn` without opening a transaction.
    ///
    /// `record` is resynchronised as soon as the writes succeed; if the
    /// caller then rolls back, reload it.
    ///
    /// # Errors
    ///
    /// See [`VersionedTable::save`].
    pub async fn save_in(
        &self,
        conn: &mut SqliteConnection,
        record: &mut Record,
    ) -> Result<SaveOutcome> {
        let (outcome, id, values) = self.write(conn, record, Utc::now(), false).await?;
        record.mark_persisted(id, values);
        Ok(outcome)
    }

    /// Deletes `record` in its own transaction: closes the open snapshot,
    /// appends a closed tombstone and removes the live row.
    ///
    /// On success the record becomes transient again, keeping its values.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::InvalidRecord`] for transient records and
    /// [`VersioningError::RecordNotFound`] if the live row is gone.
    pub async fn delete(&self, record: &mut Record) -> Result<Snapshot> {
        let id = persisted_id(record)?;
        let mut tx = self.pool.begin().await?;
        let tombstone = self.remove(&mut tx, id, Utc::now()).await?;
        tx.commit().await?;
        record.mark_transient();
        Ok(tombstone)
    }

    /// Deletes `record` on `conn` without opening a transaction.
    ///
    /// # Errors
    ///
    /// See [`VersionedTable::delete`].
    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        record: &mut Record,
    ) -> Result<Snapshot> {
        let id = persisted_id(record)?;
        let tombstone = self.remove(conn, id, Utc::now()).await?;
        record.mark_transient();
        Ok(tombstone)
    }

    /// Restores the fields of an earlier version and saves them as a new
    /// version. History is only ever appended to.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::VersionNotFound`] if `target` resolves to
    /// no snapshot of this record, [`VersioningError::InvalidRecord`] for
    /// transient records or snapshots of another record.
    pub async fn revert(
        &self,
        record: &mut Record,
        target: impl Into<RevertTarget>,
    ) -> Result<SaveOutcome> {
        let target = target.into();
        let id = persisted_id(record)?;
        let mut tx = self.pool.begin().await?;
        let snapshot = self.resolve(&mut tx, id, target).await?;

        let mut reverted = record.clone();
        for (name, value) in &snapshot.fields {
            reverted.set(name.clone(), value.clone());
        }
        let (outcome, id, values) = self.write(&mut tx, &reverted, Utc::now(), true).await?;
        tx.commit().await?;

        record.mark_persisted(id, values);
        tracing::info!(
            table = %self.live.table,
            record_id = %id,
            from_version = snapshot.version_number,
            "record reverted"
        );
        Ok(outcome)
    }

    async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        id: RecordId,
        target: RevertTarget,
    ) -> Result<Snapshot> {
        let store = self.store();
        let found = match &target {
            RevertTarget::Version(n) => store.find_by_version_number(conn, id, *n).await?,
            RevertTarget::Offset(k) => store.find_by_relative_offset(conn, id, *k).await?,
            RevertTarget::Snapshot(snapshot) => {
                if snapshot.record_id != id {
                    return Err(VersioningError::InvalidRecord(format!(
                        "snapshot {} belongs to record {}, not {id}",
                        snapshot.snapshot_id, snapshot.record_id
                    )));
                }
                Some(snapshot.as_ref().clone())
            }
        };
        found.ok_or_else(|| VersioningError::VersionNotFound {
            record_id: id,
            target: target.to_string(),
        })
    }

    /// Writes `record` and its history; returns the outcome and the new
    /// synchronised state without touching `record`.
    ///
    /// With `always_version` a persisted record gets a new version even when
    /// no field changed.
    async fn write(
        &self,
        conn: &mut SqliteConnection,
        record: &Record,
        now: DateTime<Utc>,
        always_version: bool,
    ) -> Result<(SaveOutcome, RecordId, BTreeMap<String, Value>)> {
        self.check_fields(record)?;
        let store = self.store();

        match (record.state(), record.id()) {
            (RecordState::Persisted, Some(id)) => {
                let versioned = always_version || record.is_dirty();
                self.update_row(conn, id, record.values()).await?;
                let values = self
                    .read_row(conn, id)
                    .await?
                    .ok_or(VersioningError::RecordNotFound(id))?;
                if !versioned {
                    tracing::debug!(
                        table = %self.live.table,
                        record_id = %id,
                        "no changes, history untouched"
                    );
                    return Ok((SaveOutcome::Unchanged, id, values));
                }

                match store.find_open_snapshot(conn, id).await? {
                    Some(open) => {
                        store.close_snapshot(conn, &open, now).await?;
                    }
                    None => {
                        tracing::debug!(
                            table = %self.live.table,
                            record_id = %id,
                            "no open snapshot to close"
                        );
                    }
                }
                let version = store.next_version_number(conn, id).await?;
                let snapshot = store
                    .insert_snapshot(conn, &values, version, id, false, now)
                    .await?;
                tracing::debug!(table = %self.live.table, record_id = %id, version, "new version");
                Ok((SaveOutcome::Versioned(snapshot), id, values))
            }
            _ => {
                let id = self.insert_row(conn, record.values()).await?;
                let values = self
                    .read_row(conn, id)
                    .await?
                    .ok_or(VersioningError::RecordNotFound(id))?;
                let snapshot = store
                    .insert_snapshot(conn, &values, 1, id, false, now)
                    .await?;
                tracing::info!(table = %self.live.table, record_id = %id, "record created");
                Ok((SaveOutcome::Created(snapshot), id, values))
            }
        }
    }

    async fn remove(
        &self,
        conn: &mut SqliteConnection,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let store = self.store();
        let values = self
            .read_row(conn, id)
            .await?
            .ok_or(VersioningError::RecordNotFound(id))?;

        if let Some(open) = store.find_open_snapshot(conn, id).await? {
            store.close_snapshot(conn, &open, now).await?;
        }
        let version = store.next_version_number(conn, id).await?;
        let tombstone = store
            .insert_snapshot(conn, &values, version, id, true, now)
            .await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ?",
            ident(&self.live.table),
            ident(LIVE_PRIMARY_KEY)
        ))
        .bind(id.get())
        .execute(&mut *conn)
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(VersioningError::RecordNotFound(id));
        }

        tracing::info!(table = %self.live.table, record_id = %id, version, "record deleted");
        Ok(tombstone)
    }

    fn check_fields(&self, record: &Record) -> Result<()> {
        match record
            .values()
            .keys()
            .find(|name| self.live.get(name).is_none())
        {
            Some(unknown) => Err(VersioningError::InvalidRecord(format!(
                "`{}` has no field `{unknown}`",
                self.live.table
            ))),
            None => Ok(()),
        }
    }

    async fn insert_row(
        &self,
        conn: &mut SqliteConnection,
        values: &BTreeMap<String, Value>,
    ) -> Result<RecordId> {
        let table = ident(&self.live.table);
        let sql = if values.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                ident_list(values.keys().map(String::as_str)),
                placeholders(values.len())
            )
        };
        let mut query = sqlx::query(&sql);
        for value in values.values() {
            query = bind_value(query, value);
        }
        let result = query.execute(&mut *conn).await?;
        Ok(RecordId::new(result.last_insert_rowid()))
    }

    async fn update_row(
        &self,
        conn: &mut SqliteConnection,
        id: RecordId,
        values: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let assignments = values
            .keys()
            .map(|name| format!("{} = ?", ident(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?",
            ident(&self.live.table),
            ident(LIVE_PRIMARY_KEY)
        );
        let mut query = sqlx::query(&sql);
        for value in values.values() {
            query = bind_value(query, value);
        }
        let result = query.bind(id.get()).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(VersioningError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn read_row(
        &self,
        conn: &mut SqliteConnection,
        id: RecordId,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let columns = std::iter::once(LIVE_PRIMARY_KEY)
            .chain(self.live.fields.iter().map(|f| f.name.as_str()));
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            ident_list(columns),
            ident(&self.live.table),
            ident(LIVE_PRIMARY_KEY)
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|row| self.decode_row(&row)).transpose()
    }

    fn decode_row(&self, row: &SqliteRow) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for field in &self.live.fields {
            values.insert(field.name.clone(), decode_value(row, &field.name, field.kind)?);
        }
        Ok(values)
    }
}

fn persisted_id(record: &Record) -> Result<RecordId> {
    record
        .id()
        .ok_or_else(|| VersioningError::InvalidRecord("record has not been saved".to_string()))
}
