//! Schema migrations that keep shadow tables in step with live tables.
//!
//! [`MigrationPropagator::apply`] runs a batch of [`SchemaOperation`]s in
//! one transaction. For each operation [`plan_shadow_action`] decides,
//! from a cached view of the store's schema, whether and how the shadow
//! table follows:
//!
//! | Live operation                    | Shadow action                         |
//! |-----------------------------------|---------------------------------------|
//! | add / drop index                  | none                                  |
//! | add column (link)                 | none                                  |
//! | add column                        | same, unless already present          |
//! | drop / rename column, (not) null  | same, if the shadow has the column    |
//! | rename table                      | rename shadow, re-point snapshots     |
//!
//! Destructive mirrors run before the live change, additive ones after.

use std::fmt;

use serde::Serialize;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::schema::{
    BOOKKEEPING_COLUMNS, ORIGINAL_RECORD_ID, SNAPSHOT_ID, is_bookkeeping_field,
    live_table_name_of, shadow_table_name,
};
use crate::domain::SchemaOperation;
use crate::error::{Result, VersioningError};
use crate::persistence::ddl::SchemaEditor;
use crate::persistence::introspect::{SchemaCatalog, introspect_table};
use crate::persistence::sql::{create_shadow_indexes, ident, shadow_index_name};

/// Why an operation was not mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Index changes stay on the live table.
    IndexOnly,
    /// The table has no shadow table.
    NotVersioned,
    /// The added column is a relational link.
    RelationalLink,
    /// The shadow table does not have the column.
    ColumnAbsent,
    /// The shadow table already has a column of that name.
    ColumnPresent,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IndexOnly => "index only",
            Self::NotVersioned => "not versioned",
            Self::RelationalLink => "relational link",
            Self::ColumnAbsent => "column absent from shadow",
            Self::ColumnPresent => "column already in shadow",
        };
        f.write_str(text)
    }
}

/// What to do on the shadow side of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowPlan {
    /// Run the live operation alone.
    Skip(SkipReason),
    /// Run `op` against the shadow table too.
    Mirror {
        /// The operation retargeted at the shadow table.
        op: SchemaOperation,
        /// Run the mirror before the live operation.
        shadow_first: bool,
    },
    /// Rename both tables and re-point snapshots.
    RenameTable {
        /// Current shadow table name.
        old_shadow: String,
        /// Shadow table name after the rename.
        new_shadow: String,
    },
}

/// What happened on the shadow side of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ShadowAction {
    /// Nothing was mirrored.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
    /// The operation was mirrored.
    Mirrored {
        /// The operation as run against the shadow table.
        operation: SchemaOperation,
    },
    /// The shadow table was renamed along with the live table.
    Renamed {
        /// Shadow table name before.
        old_shadow: String,
        /// Shadow table name after.
        new_shadow: String,
        /// Snapshots re-pointed at a live row.
        relinked: usize,
        /// Snapshots whose live row no longer exists; their key is kept.
        dangling: usize,
    },
}

/// Result of one operation in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    /// The live operation.
    pub operation: SchemaOperation,
    /// Live table it ran against.
    pub table: String,
    /// Shadow-side result.
    pub shadow: ShadowAction,
}

/// Result of a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Identifier used in log events for this batch.
    pub batch_id: Uuid,
    /// One entry per operation, in order.
    pub outcomes: Vec<OperationOutcome>,
    /// How many times the schema was introspected.
    pub introspections: usize,
}

/// Decides the shadow-side action for `op` given the store's schema.
///
/// # Errors
///
/// Returns [`VersioningError::SchemaConflict`] when `op` would introduce a
/// bookkeeping column name on a versioned table, or rename a versioned
/// table to a shadow-style name.
pub fn plan_shadow_action(op: &SchemaOperation, catalog: &SchemaCatalog) -> Result<ShadowPlan> {
    if !op.changes_columns() {
        return Ok(ShadowPlan::Skip(SkipReason::IndexOnly));
    }
    let shadow = shadow_table_name(op.table());
    if !catalog.has_table(&shadow) {
        return Ok(ShadowPlan::Skip(SkipReason::NotVersioned));
    }
    let mirror_if_present = |column: &str| {
        if catalog.has_column(&shadow, column) {
            ShadowPlan::Mirror {
                op: op.retarget(&shadow),
                shadow_first: op.is_destructive(),
            }
        } else {
            ShadowPlan::Skip(SkipReason::ColumnAbsent)
        }
    };

    let plan = match op {
        SchemaOperation::AddColumn { table, field } => {
            if is_bookkeeping_field(&field.name) {
                return Err(VersioningError::conflict(
                    table,
                    format!("`{}` is a bookkeeping column of `{shadow}`", field.name),
                ));
            }
            if field.is_link() {
                ShadowPlan::Skip(SkipReason::RelationalLink)
            } else if catalog.has_column(&shadow, &field.name) {
                ShadowPlan::Skip(SkipReason::ColumnPresent)
            } else {
                ShadowPlan::Mirror {
                    op: SchemaOperation::AddColumn {
                        table: shadow.clone(),
                        field: field.for_shadow(),
                    },
                    shadow_first: false,
                }
            }
        }
        SchemaOperation::RenameColumn {
            table,
            old_name,
            new_name,
        } => {
            if is_bookkeeping_field(new_name) {
                return Err(VersioningError::conflict(
                    table,
                    format!("`{new_name}` is a bookkeeping column of `{shadow}`"),
                ));
            }
            mirror_if_present(old_name)
        }
        SchemaOperation::DropColumn { column, .. }
        | SchemaOperation::AddNotNull { column, .. }
        | SchemaOperation::DropNotNull { column, .. } => mirror_if_present(column),
        SchemaOperation::RenameTable { old_name, new_name } => {
            if live_table_name_of(new_name).is_some() {
                return Err(VersioningError::conflict(
                    old_name,
                    format!("`{new_name}` would read as a shadow table name"),
                ));
            }
            ShadowPlan::RenameTable {
                old_shadow: shadow,
                new_shadow: shadow_table_name(new_name),
            }
        }
        SchemaOperation::AddIndex { .. } | SchemaOperation::DropIndex { .. } => {
            ShadowPlan::Skip(SkipReason::IndexOnly)
        }
    };
    Ok(plan)
}

/// Applies migration batches with their shadow mirrors.
#[derive(Debug, Clone)]
pub struct MigrationPropagator {
    pool: SqlitePool,
}

impl MigrationPropagator {
    /// Creates a propagator over `pool`.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies `operations` in order, each with its shadow mirror.
    ///
    /// The batch commits as a whole or not at all. Foreign-key enforcement
    /// is off while it runs and is switched back on afterwards, whether or
    /// not the batch succeeded; a batch that leaves a foreign key violated
    /// is rolled back.
    ///
    /// # Errors
    ///
    /// Returns the first failing operation's error; no change is kept.
    pub async fn apply(&self, operations: &[SchemaOperation]) -> Result<MigrationReport> {
        let batch_id = Uuid::new_v4();
        tracing::info!(%batch_id, operations = operations.len(), "migration batch started");

        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
        let result = run_batch(&mut conn, batch_id, operations).await;
        let restored = sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await;
        if let Err(e) = &restored {
            tracing::warn!(%batch_id, error = %e, "foreign keys not restored, closing connection");
            let _ = conn.detach().close().await;
        }

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(%batch_id, error = %e, "migration batch rolled back");
                return Err(e);
            }
        };
        restored?;
        tracing::info!(%batch_id, introspections = report.introspections, "migration batch committed");
        Ok(report)
    }

    /// Parses a JSON plan and applies it.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::InvalidPlan`] for malformed JSON, or any
    /// error of [`MigrationPropagator::apply`].
    pub async fn apply_json(&self, plan: &str) -> Result<MigrationReport> {
        let operations = SchemaOperation::parse_plan(plan)?;
        self.apply(&operations).await
    }
}

async fn run_batch(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    operations: &[SchemaOperation],
) -> Result<MigrationReport> {
    let mut tx = conn.begin().await?;
    let mut catalog = SchemaCatalog::new();
    let mut outcomes = Vec::with_capacity(operations.len());

    for op in operations {
        catalog.ensure_loaded(&mut tx).await?;
        let plan = plan_shadow_action(op, &catalog)?;
        tracing::debug!(
            %batch_id,
            kind = op.name(),
            table = op.table(),
            ?plan,
            "planned"
        );

        let shadow = match plan {
            ShadowPlan::Skip(reason) => {
                SchemaEditor::run(&mut tx, op).await?;
                ShadowAction::Skipped { reason }
            }
            ShadowPlan::Mirror {
                op: mirrored,
                shadow_first,
            } => {
                if shadow_first {
                    SchemaEditor::run(&mut tx, &mirrored).await?;
                    SchemaEditor::run(&mut tx, op).await?;
                } else {
                    SchemaEditor::run(&mut tx, op).await?;
                    SchemaEditor::run(&mut tx, &mirrored).await?;
                }
                ShadowAction::Mirrored {
                    operation: mirrored,
                }
            }
            ShadowPlan::RenameTable {
                old_shadow,
                new_shadow,
            } => rename_versioned_table(&mut tx, op, old_shadow, new_shadow).await?,
        };

        if op.changes_columns() {
            catalog.invalidate();
        }
        tracing::info!(%batch_id, operation = %op, shadow = ?shadow, "operation applied");
        outcomes.push(OperationOutcome {
            operation: op.clone(),
            table: op.table().to_string(),
            shadow,
        });
    }

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *tx)
        .await?;
    if !violations.is_empty() {
        return Err(VersioningError::InvalidSchema(format!(
            "migration leaves {} foreign key violation(s)",
            violations.len()
        )));
    }

    tx.commit().await?;
    Ok(MigrationReport {
        batch_id,
        outcomes,
        introspections: catalog.introspections(),
    })
}

/// Renames a live table and its shadow table, keeping every snapshot's
/// weak reference pointing at the same live row.
async fn rename_versioned_table(
    conn: &mut SqliteConnection,
    op: &SchemaOperation,
    old_shadow: String,
    new_shadow: String,
) -> Result<ShadowAction> {
    let SchemaOperation::RenameTable { new_name, .. } = op else {
        return Err(VersioningError::InvalidSchema(format!(
            "`{op}` is not a table rename"
        )));
    };

    let references: Vec<(i64, i64)> = sqlx::query_as(&format!(
        "SELECT {}, {} FROM {}",
        ident(SNAPSHOT_ID),
        ident(ORIGINAL_RECORD_ID),
        ident(&old_shadow)
    ))
    .fetch_all(&mut *conn)
    .await?;

    // Index names carry the shadow table name.
    let indexed: Vec<&str> = BOOKKEEPING_COLUMNS
        .iter()
        .filter(|c| c.indexed)
        .map(|c| c.name)
        .collect();
    for column in &indexed {
        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}",
            ident(&shadow_index_name(&old_shadow, column))
        ))
        .execute(&mut *conn)
        .await?;
    }

    SchemaEditor::run(
        conn,
        &SchemaOperation::RenameTable {
            old_name: old_shadow.clone(),
            new_name: new_shadow.clone(),
        },
    )
    .await?;
    SchemaEditor::run(conn, op).await?;

    for statement in create_shadow_indexes(&new_shadow, &indexed) {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }

    let Some(live) = introspect_table(conn, new_name).await? else {
        return Err(VersioningError::InvalidSchema(format!(
            "table `{new_name}` missing after rename"
        )));
    };
    let Some(key) = live.primary_key_column() else {
        return Err(VersioningError::InvalidSchema(format!(
            "table `{new_name}` has no single-column key"
        )));
    };

    let lookup = format!(
        "SELECT {key} FROM {} WHERE {key} = ?",
        ident(new_name),
        key = ident(key)
    );
    let relink = format!(
        "UPDATE {} SET {} = ? WHERE {} = ?",
        ident(&new_shadow),
        ident(ORIGINAL_RECORD_ID),
        ident(SNAPSHOT_ID)
    );
    let (mut relinked, mut dangling) = (0_usize, 0_usize);
    for (snapshot_id, record_ref) in references {
        let resolved: Option<i64> = sqlx::query_scalar(&lookup)
            .bind(record_ref)
            .fetch_optional(&mut *conn)
            .await?;
        match resolved {
            Some(live_id) => {
                sqlx::query(&relink)
                    .bind(live_id)
                    .bind(snapshot_id)
                    .execute(&mut *conn)
                    .await?;
                relinked += 1;
            }
            None => dangling += 1,
        }
    }

    Ok(ShadowAction::Renamed {
        old_shadow,
        new_shadow,
        relinked,
        dangling,
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{FieldDef, LiveSchema, Record, Value};
    use crate::persistence::connect_in_memory;
    use crate::persistence::introspect::TableInfo;
    use crate::service::VersionedTable;

    fn food_schema(table: &str) -> LiveSchema {
        LiveSchema::new(table)
            .field(FieldDef::text("name").nullable())
            .field(FieldDef::boolean("is_tasty"))
    }

    struct Fixture {
        pool: SqlitePool,
        food: VersionedTable,
        propagator: MigrationPropagator,
    }

    async fn fixture() -> Fixture {
        let Ok(pool) = connect_in_memory().await else {
            panic!("in-memory pool");
        };
        let (Ok(food), Ok(menu)) = (
            VersionedTable::new(pool.clone(), food_schema("food")),
            VersionedTable::new(
                pool.clone(),
                LiveSchema::new("menu").field(FieldDef::text("name")),
            ),
        ) else {
            panic!("schemas should derive");
        };
        assert!(food.create_schema().await.is_ok());
        assert!(menu.create_schema().await.is_ok());
        Fixture {
            propagator: MigrationPropagator::new(pool.clone()),
            pool,
            food,
        }
    }

    impl Fixture {
        async fn apply(&self, operations: &[SchemaOperation]) -> MigrationReport {
            match self.propagator.apply(operations).await {
                Ok(report) => report,
                Err(e) => panic!("migration failed: {e}"),
            }
        }

        async fn apply_one(&self, op: SchemaOperation) -> ShadowAction {
            let report = self.apply(&[op]).await;
            let Some(outcome) = report.outcomes.into_iter().next() else {
                panic!("one outcome per operation");
            };
            outcome.shadow
        }

        async fn table(&self, name: &str) -> Option<TableInfo> {
            let Ok(mut conn) = self.pool.acquire().await else {
                panic!("acquire failed");
            };
            match introspect_table(&mut conn, name).await {
                Ok(info) => info,
                Err(e) => panic!("introspection failed: {e}"),
            }
        }

        async fn has_column(&self, table: &str, column: &str) -> bool {
            let Some(info) = self.table(table).await else {
                panic!("table {table} should exist");
            };
            info.column(column).is_some()
        }

        async fn is_nullable(&self, table: &str, column: &str) -> bool {
            let Some(info) = self.table(table).await else {
                panic!("table {table} should exist");
            };
            let Some(column) = info.column(column) else {
                panic!("{table}.{column} should exist");
            };
            !column.not_null
        }

        async fn edit(&self, op: SchemaOperation) {
            let Ok(mut conn) = self.pool.acquire().await else {
                panic!("acquire failed");
            };
            if let Err(e) = SchemaEditor::run(&mut conn, &op).await {
                panic!("{op}: {e}");
            }
        }
    }

    fn add_column(table: &str, field: FieldDef) -> SchemaOperation {
        SchemaOperation::AddColumn {
            table: table.to_string(),
            field,
        }
    }

    fn link_column() -> SchemaOperation {
        add_column("food", FieldDef::link("another_column", "menu"))
    }

    #[tokio::test]
    async fn add_column_is_mirrored() {
        let fx = fixture().await;
        let action = fx
            .apply_one(add_column("food", FieldDef::text("another_column").nullable()))
            .await;
        assert!(matches!(action, ShadowAction::Mirrored { .. }));
        assert!(fx.has_column("food", "another_column").await);
        assert!(fx.has_column("food_version", "another_column").await);

        let extended = food_schema("food").field(FieldDef::text("another_column").nullable());
        let Ok(food) = VersionedTable::new(fx.pool.clone(), extended) else {
            panic!("extended schema");
        };
        let mut dish = Record::new()
            .with("name", "soup")
            .with("is_tasty", true)
            .with("another_column", "hot");
        assert!(food.save(&mut dish).await.is_ok());
        let Some(id) = dish.id() else {
            panic!("saved");
        };
        let Ok(history) = food.history(id).await else {
            panic!("history");
        };
        assert!(history
            .iter()
            .all(|s| s.get("another_column") == Some(&Value::from("hot"))));
    }

    #[tokio::test]
    async fn unique_constraint_stays_on_the_live_table() {
        let fx = fixture().await;
        let action = fx
            .apply_one(add_column("food", FieldDef::text("code").nullable().unique()))
            .await;
        let ShadowAction::Mirrored {
            operation: SchemaOperation::AddColumn { field, .. },
        } = action
        else {
            panic!("add column should be mirrored");
        };
        assert!(!field.unique);
        let Some(shadow) = fx.table("food_version").await else {
            panic!("shadow exists");
        };
        assert!(!shadow.indexes.iter().any(|i| i.covers("code")));
    }

    #[tokio::test]
    async fn link_column_is_not_mirrored() {
        let fx = fixture().await;
        let action = fx.apply_one(link_column()).await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::RelationalLink
            }
        );
        assert!(fx.is_nullable("food", "another_column").await);
        assert!(!fx.has_column("food_version", "another_column").await);
        let Some(food) = fx.table("food").await else {
            panic!("food exists");
        };
        assert!(food.foreign_keys.iter().any(|fk| fk.table == "menu"));
    }

    #[tokio::test]
    async fn drop_column_is_mirrored() {
        let fx = fixture().await;
        fx.apply_one(SchemaOperation::DropColumn {
            table: "food".to_string(),
            column: "is_tasty".to_string(),
        })
        .await;
        assert!(!fx.has_column("food", "is_tasty").await);
        assert!(!fx.has_column("food_version", "is_tasty").await);
    }

    #[tokio::test]
    async fn drop_column_absent_from_shadow() {
        let fx = fixture().await;
        fx.apply_one(link_column()).await;
        let action = fx
            .apply_one(SchemaOperation::DropColumn {
                table: "food".to_string(),
                column: "another_column".to_string(),
            })
            .await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::ColumnAbsent
            }
        );
        assert!(!fx.has_column("food", "another_column").await);
    }

    #[tokio::test]
    async fn rename_column_is_mirrored() {
        let fx = fixture().await;
        fx.apply_one(SchemaOperation::RenameColumn {
            table: "food".to_string(),
            old_name: "is_tasty".to_string(),
            new_name: "was_tasty".to_string(),
        })
        .await;
        for table in ["food", "food_version"] {
            assert!(!fx.has_column(table, "is_tasty").await);
            assert!(fx.has_column(table, "was_tasty").await);
        }
    }

    #[tokio::test]
    async fn rename_column_absent_from_shadow() {
        let fx = fixture().await;
        fx.apply_one(link_column()).await;
        fx.apply_one(SchemaOperation::RenameColumn {
            table: "food".to_string(),
            old_name: "another_column".to_string(),
            new_name: "new_column".to_string(),
        })
        .await;
        assert!(!fx.has_column("food", "another_column").await);
        assert!(fx.has_column("food", "new_column").await);
        assert!(!fx.has_column("food_version", "another_column").await);
        assert!(!fx.has_column("food_version", "new_column").await);
    }

    #[tokio::test]
    async fn add_not_null_is_mirrored() {
        let fx = fixture().await;
        assert!(fx.is_nullable("food", "name").await);
        assert!(fx.is_nullable("food_version", "name").await);
        fx.apply_one(SchemaOperation::AddNotNull {
            table: "food".to_string(),
            column: "name".to_string(),
        })
        .await;
        assert!(!fx.is_nullable("food", "name").await);
        assert!(!fx.is_nullable("food_version", "name").await);
    }

    #[tokio::test]
    async fn add_not_null_absent_from_shadow() {
        let fx = fixture().await;
        fx.apply_one(add_column(
            "food",
            FieldDef::text("another_column")
                .nullable()
                .default_value(Value::from("")),
        ))
        .await;
        fx.edit(SchemaOperation::DropColumn {
            table: "food_version".to_string(),
            column: "another_column".to_string(),
        })
        .await;
        assert!(fx.is_nullable("food", "another_column").await);

        let action = fx
            .apply_one(SchemaOperation::AddNotNull {
                table: "food".to_string(),
                column: "another_column".to_string(),
            })
            .await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::ColumnAbsent
            }
        );
        assert!(!fx.is_nullable("food", "another_column").await);
        assert!(!fx.has_column("food_version", "another_column").await);
    }

    #[tokio::test]
    async fn drop_not_null_is_mirrored() {
        let fx = fixture().await;
        assert!(!fx.is_nullable("food", "is_tasty").await);
        assert!(!fx.is_nullable("food_version", "is_tasty").await);
        fx.apply_one(SchemaOperation::DropNotNull {
            table: "food".to_string(),
            column: "is_tasty".to_string(),
        })
        .await;
        assert!(fx.is_nullable("food", "is_tasty").await);
        assert!(fx.is_nullable("food_version", "is_tasty").await);
    }

    #[tokio::test]
    async fn drop_not_null_absent_from_shadow() {
        let fx = fixture().await;
        fx.apply_one(add_column(
            "food",
            FieldDef::text("another_column").default_value(Value::from("")),
        ))
        .await;
        fx.edit(SchemaOperation::DropColumn {
            table: "food_version".to_string(),
            column: "another_column".to_string(),
        })
        .await;
        assert!(!fx.is_nullable("food", "another_column").await);

        fx.apply_one(SchemaOperation::DropNotNull {
            table: "food".to_string(),
            column: "another_column".to_string(),
        })
        .await;
        assert!(fx.is_nullable("food", "another_column").await);
        assert!(!fx.has_column("food_version", "another_column").await);
    }

    #[tokio::test]
    async fn add_column_already_in_shadow_is_not_mirrored() {
        let fx = fixture().await;
        fx.edit(add_column("food_version", FieldDef::text("note").nullable()))
            .await;
        let action = fx
            .apply_one(add_column("food", FieldDef::text("note").nullable()))
            .await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::ColumnPresent
            }
        );
        assert!(fx.has_column("food", "note").await);
    }

    #[tokio::test]
    async fn rename_table_relinks_snapshots() {
        let fx = fixture().await;
        let mut ids = Vec::new();
        for name in ["1", "2", "3", "4"] {
            let mut food = Record::new().with("name", name).with("is_tasty", false);
            assert!(fx.food.save(&mut food).await.is_ok());
            ids.push((food.id(), name));
        }

        let action = fx
            .apply_one(SchemaOperation::RenameTable {
                old_name: "food".to_string(),
                new_name: "chow".to_string(),
            })
            .await;
        assert_eq!(
            action,
            ShadowAction::Renamed {
                old_shadow: "food_version".to_string(),
                new_shadow: "chow_version".to_string(),
                relinked: 4,
                dangling: 0,
            }
        );

        assert!(fx.table("chow").await.is_some());
        assert!(fx.table("chow_version").await.is_some());
        assert!(fx.table("food").await.is_none());
        assert!(fx.table("food_version").await.is_none());

        let Some(shadow) = fx.table("chow_version").await else {
            panic!("renamed shadow exists");
        };
        let index_names: Vec<&str> = shadow.indexes.iter().map(|i| i.name.as_str()).collect();
        assert!(index_names.contains(&"chow_version_valid_from"));
        assert!(index_names.contains(&"chow_version_original_record_id"));
        assert!(!index_names.iter().any(|n| n.starts_with("food_version")));

        let Ok(chow) = VersionedTable::new(fx.pool.clone(), food_schema("chow")) else {
            panic!("chow schema");
        };
        for (id, name) in ids {
            let Some(id) = id else {
                panic!("saved records have ids");
            };
            let Ok(record) = chow.get(id).await else {
                panic!("chow {id} should load");
            };
            assert_eq!(record.get("name"), Some(&Value::from(name)));
            let Ok(history) = chow.history(id).await else {
                panic!("history");
            };
            assert_eq!(history.len(), 1);
            let Some(snapshot) = history.first() else {
                panic!("one snapshot");
            };
            assert_eq!(snapshot.get("name"), Some(&Value::from(name)));
            assert_eq!(snapshot.get("is_tasty"), Some(&Value::from(false)));
        }
    }

    #[tokio::test]
    async fn rename_table_keeps_tombstone_references() {
        let fx = fixture().await;
        let mut gone = Record::new().with("name", "gone").with("is_tasty", true);
        assert!(fx.food.save(&mut gone).await.is_ok());
        let gone_id = gone.id();
        assert!(fx.food.delete(&mut gone).await.is_ok());
        let mut kept = Record::new().with("name", "kept").with("is_tasty", true);
        assert!(fx.food.save(&mut kept).await.is_ok());

        let action = fx
            .apply_one(SchemaOperation::RenameTable {
                old_name: "food".to_string(),
                new_name: "chow".to_string(),
            })
            .await;
        let ShadowAction::Renamed {
            relinked, dangling, ..
        } = action
        else {
            panic!("rename should rename the shadow");
        };
        assert_eq!((relinked, dangling), (1, 2));

        let Ok(chow) = VersionedTable::new(fx.pool.clone(), food_schema("chow")) else {
            panic!("chow schema");
        };
        let Some(gone_id) = gone_id else {
            panic!("saved");
        };
        let Ok(history) = chow.history(gone_id).await else {
            panic!("history");
        };
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|s| s.deleted));
    }

    #[tokio::test]
    async fn index_operations_stay_on_the_live_table() {
        let fx = fixture().await;
        let action = fx
            .apply_one(SchemaOperation::AddIndex {
                table: "food".to_string(),
                columns: vec!["name".to_string()],
                unique: false,
            })
            .await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::IndexOnly
            }
        );
        let (Some(food), Some(shadow)) = (fx.table("food").await, fx.table("food_version").await)
        else {
            panic!("tables exist");
        };
        assert!(food.indexes.iter().any(|i| i.name == "food_name"));
        assert!(!shadow.indexes.iter().any(|i| i.covers("name")));

        fx.apply_one(SchemaOperation::DropIndex {
            table: "food".to_string(),
            index_name: "food_name".to_string(),
        })
        .await;
        let Some(food) = fx.table("food").await else {
            panic!("food exists");
        };
        assert!(!food.indexes.iter().any(|i| i.covers("name")));
    }

    #[tokio::test]
    async fn catalog_is_reused_until_columns_change() {
        let fx = fixture().await;
        let indexes = fx
            .apply(&[
                SchemaOperation::AddIndex {
                    table: "food".to_string(),
                    columns: vec!["name".to_string()],
                    unique: false,
                },
                SchemaOperation::DropIndex {
                    table: "food".to_string(),
                    index_name: "food_name".to_string(),
                },
                add_column("food", FieldDef::text("a").nullable()),
            ])
            .await;
        assert_eq!(indexes.introspections, 1);

        let columns = fx
            .apply(&[
                add_column("food", FieldDef::text("b").nullable()),
                SchemaOperation::RenameColumn {
                    table: "food".to_string(),
                    old_name: "b".to_string(),
                    new_name: "c".to_string(),
                },
            ])
            .await;
        assert_eq!(columns.introspections, 2);
        // The rename saw the column the first operation mirrored.
        assert!(matches!(
            columns.outcomes.get(1).map(|o| &o.shadow),
            Some(ShadowAction::Mirrored { .. })
        ));
        assert!(fx.has_column("food_version", "c").await);
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let fx = fixture().await;
        let result = fx
            .propagator
            .apply(&[
                add_column("food", FieldDef::text("note").nullable()),
                SchemaOperation::DropColumn {
                    table: "food".to_string(),
                    column: "missing".to_string(),
                },
            ])
            .await;
        assert!(matches!(result, Err(VersioningError::InvalidSchema(_))));
        assert!(!fx.has_column("food", "note").await);
        assert!(!fx.has_column("food_version", "note").await);
        // The restored connection went back to the pool with the store intact.
        assert!(fx.has_column("food", "name").await);

        let enforced: std::result::Result<i64, sqlx::Error> =
            sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(&fx.pool).await;
        assert_eq!(enforced.ok(), Some(1));
    }

    #[tokio::test]
    async fn bookkeeping_names_are_rejected() {
        let fx = fixture().await;
        let add = fx
            .propagator
            .apply(&[add_column("food", FieldDef::timestamp("valid_from"))])
            .await;
        assert!(matches!(add, Err(VersioningError::SchemaConflict { .. })));

        let rename = fx
            .propagator
            .apply(&[SchemaOperation::RenameColumn {
                table: "food".to_string(),
                old_name: "name".to_string(),
                new_name: "deleted".to_string(),
            }])
            .await;
        assert!(matches!(rename, Err(VersioningError::SchemaConflict { .. })));

        let table = fx
            .propagator
            .apply(&[SchemaOperation::RenameTable {
                old_name: "food".to_string(),
                new_name: "dish_version".to_string(),
            }])
            .await;
        assert!(matches!(table, Err(VersioningError::SchemaConflict { .. })));
        assert!(fx.table("food").await.is_some());
    }

    #[tokio::test]
    async fn unversioned_tables_are_left_alone() {
        let fx = fixture().await;
        let created = sqlx::query("CREATE TABLE audit (id INTEGER PRIMARY KEY, line TEXT)")
            .execute(&fx.pool)
            .await;
        assert!(created.is_ok());
        let action = fx
            .apply_one(add_column("audit", FieldDef::integer("level").nullable()))
            .await;
        assert_eq!(
            action,
            ShadowAction::Skipped {
                reason: SkipReason::NotVersioned
            }
        );
        assert!(fx.has_column("audit", "level").await);
        assert!(fx.table("audit_version").await.is_none());
    }

    #[tokio::test]
    async fn applies_a_json_plan() {
        let fx = fixture().await;
        let plan = r#"[
            {"op": "add_column", "table": "food", "field": {"name": "note", "kind": "text", "nullable": true}},
            {"op": "rename_column", "table": "food", "old_name": "is_tasty", "new_name": "was_tasty"}
        ]"#;
        let Ok(report) = fx.propagator.apply_json(plan).await else {
            panic!("plan should apply");
        };
        assert_eq!(report.outcomes.len(), 2);
        assert!(fx.has_column("food_version", "note").await);
        assert!(fx.has_column("food_version", "was_tasty").await);

        let malformed = fx.propagator.apply_json("[{\"op\": \"explode\"}]").await;
        assert!(matches!(malformed, Err(VersioningError::InvalidPlan(_))));
    }

    mod planning {
        use super::*;

        fn catalog() -> SchemaCatalog {
            SchemaCatalog::from_tables([
                ("food", &["id", "name", "is_tasty", "menu_id"][..]),
                (
                    "food_version",
                    &["snapshot_id", "name", "is_tasty", "original_record_id"][..],
                ),
                ("menu", &["id", "name"][..]),
            ])
        }

        fn plan(op: &SchemaOperation) -> ShadowPlan {
            match plan_shadow_action(op, &catalog()) {
                Ok(plan) => plan,
                Err(e) => panic!("{op}: {e}"),
            }
        }

        #[test]
        fn destructive_mirrors_run_first() {
            let drop = SchemaOperation::DropColumn {
                table: "food".to_string(),
                column: "name".to_string(),
            };
            assert_eq!(
                plan(&drop),
                ShadowPlan::Mirror {
                    op: drop.retarget("food_version"),
                    shadow_first: true,
                }
            );

            let relax = SchemaOperation::DropNotNull {
                table: "food".to_string(),
                column: "is_tasty".to_string(),
            };
            assert!(matches!(
                plan(&relax),
                ShadowPlan::Mirror {
                    shadow_first: false,
                    ..
                }
            ));
        }

        #[test]
        fn skips() {
            let cases = [
                (
                    add_column("food", FieldDef::link("menu2_id", "menu")),
                    SkipReason::RelationalLink,
                ),
                (
                    SchemaOperation::DropColumn {
                        table: "food".to_string(),
                        column: "menu_id".to_string(),
                    },
                    SkipReason::ColumnAbsent,
                ),
                (
                    add_column("menu", FieldDef::text("x").nullable()),
                    SkipReason::NotVersioned,
                ),
                (
                    add_column("food", FieldDef::text("name").nullable()),
                    SkipReason::ColumnPresent,
                ),
                (
                    SchemaOperation::DropIndex {
                        table: "food".to_string(),
                        index_name: "food_name".to_string(),
                    },
                    SkipReason::IndexOnly,
                ),
            ];
            for (op, reason) in cases {
                assert_eq!(plan(&op), ShadowPlan::Skip(reason), "{op}");
            }
        }

        #[test]
        fn rename_table_plans_the_shadow_rename() {
            let op = SchemaOperation::RenameTable {
                old_name: "food".to_string(),
                new_name: "chow".to_string(),
            };
            assert_eq!(
                plan(&op),
                ShadowPlan::RenameTable {
                    old_shadow: "food_version".to_string(),
                    new_shadow: "chow_version".to_string(),
                }
            );
        }
    }
}
