//! Persistence layer: everything that talks SQL.
//!
//! - [`sql`] renders statements and binds dynamic values.
//! - [`version_store`] reads and writes snapshots in a shadow table.
//! - [`introspect`] reads the live schema back out of the store.
//! - [`ddl`] applies single schema operations, rebuilding tables where
//!   SQLite has no `ALTER TABLE` form.
//!
//! Functions here take a `&mut SqliteConnection` and never open their own
//! transactions; the service layer owns transaction scope.

pub mod ddl;
pub mod introspect;
pub mod sql;
pub mod version_store;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::config::StoreConfig;
use crate::error::Result;

/// Opens a connection pool for `config`.
///
/// Foreign keys are enforced on every connection and the database file is
/// created if missing.
///
/// # Errors
///
/// Returns [`crate::error::VersioningError::Storage`] if the URL is
/// malformed or the database cannot be opened.
pub async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(config.connect_timeout())
        .connect_with(options)
        .await?;

    tracing::info!(url = %config.database_url, "connected to store");
    Ok(pool)
}

/// Opens a private in-memory database behind a single-connection pool.
///
/// Every pool gets its own database, alive as long as the pool is.
///
/// # Errors
///
/// Returns [`crate::error::VersioningError::Storage`] if SQLite cannot
/// open the database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}
