//! # versioned-rows
//!
//! Temporal versioning for relational records.
//!
//! Every versioned live table gets a shadow table (`<table>_version`)
//! holding one snapshot per state the live record has been in. Saving a
//! changed record closes its open snapshot and appends a new one; deleting
//! it appends a closed tombstone; reverting copies an old snapshot back and
//! saves it as a new version. History is only ever appended to.
//!
//! Schema migrations go through [`service::MigrationPropagator`], which
//! mirrors each change onto the shadow table where it applies.
//!
//! ## Architecture
//!
//! ```text
//! Callers
//!     │
//!     ├── VersionedTable (service/lifecycle)      save / delete / revert
//!     ├── MigrationPropagator (service/migration) apply(operations)
//!     │
//!     ├── Schema deriver, records, operations (domain/)
//!     │
//!     ├── VersionStore, SchemaEditor, introspection (persistence/)
//!     │
//!     └── SQLite (sqlx)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use versioned_rows::domain::{FieldDef, LiveSchema, Record};
//! use versioned_rows::persistence::connect_in_memory;
//! use versioned_rows::service::VersionedTable;
//!
//! # async fn run() -> versioned_rows::error::Result<()> {
//! let pool = connect_in_memory().await?;
//! let people = VersionedTable::new(pool, LiveSchema::new("person").field(FieldDef::text("name")))?;
//! people.create_schema().await?;
//!
//! let mut person = Record::new().with("name", "Ada");
//! people.save(&mut person).await?;
//! person.set("name", "Ada Lovelace");
//! people.save(&mut person).await?;
//! people.revert(&mut person, 1).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod telemetry;
