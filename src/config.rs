//! Store configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`).

use std::time::Duration;

/// Connection and logging settings for a versioned store.
///
/// Loaded once at startup via [`StoreConfig::from_env`], or built directly
/// with [`StoreConfig::new`] when embedding.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite connection string (e.g. `sqlite://versioned.db`).
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,

    /// Minimum idle connections in the pool.
    pub database_min_connections: u32,

    /// Timeout in seconds for acquiring a database connection.
    pub database_connect_timeout_secs: u64,

    /// Seconds a connection waits on a locked database before failing.
    pub database_busy_timeout_secs: u64,

    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

impl StoreConfig {
    /// Builds a configuration for `database_url` with default pool settings.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_max_connections: 5,
            database_min_connections: 1,
            database_connect_timeout_secs: 5,
            database_busy_timeout_secs: 5,
            log_json: false,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is missing or unparsable.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://versioned.db".to_string());

        Self {
            database_url,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
            database_min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1),
            database_connect_timeout_secs: parse_env("DATABASE_CONNECT_TIMEOUT_SECS", 5),
            database_busy_timeout_secs: parse_env("DATABASE_BUSY_TIMEOUT_SECS", 5),
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    /// Connection acquire timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database_connect_timeout_secs)
    }

    /// Busy-handler timeout as a [`Duration`].
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.database_busy_timeout_secs)
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
