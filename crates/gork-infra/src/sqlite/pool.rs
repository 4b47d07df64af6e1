//! SQLite pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows one writer at a time, so writes go through a
//! single-connection pool while reads fan out over a small multi-connection
//! pool. Both enforce foreign keys and use a busy timeout; migrations run on
//! the writer before the reader opens.

use std::path::PathBuf;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Split read/write pool for the gork store.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) and migrate the database at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Default on-disk location: `$GORK_DATA_DIR/gork.db`, falling back to
/// `~/.gork/gork.db`.
pub fn default_database_path() -> PathBuf {
    let data_dir = std::env::var("GORK_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.gork")
    });
    PathBuf::from(data_dir).join("gork.db")
}

/// Connection URL for the default database location.
pub fn default_database_url() -> String {
    format!("sqlite://{}?mode=rwc", default_database_path().display())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch_pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn creates_schema_tables() {
        let (_dir, pool) = scratch_pool().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in ["workflows", "runs", "step_runs", "step_data"] {
            assert!(names.contains(&expected), "missing table '{expected}'");
        }
    }

    #[tokio::test]
    async fn uses_wal_journal_mode() {
        let (_dir, pool) = scratch_pool().await;
        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn enforces_foreign_keys() {
        let (_dir, pool) = scratch_pool().await;
        let fk: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk.0, 1);
    }

    #[tokio::test]
    async fn migration_is_idempotent_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        drop(DatabasePool::new(&url).await.unwrap());
        // Reopening runs the migration machinery again without error.
        DatabasePool::new(&url).await.unwrap();
    }

    #[test]
    fn default_path_ends_with_db_name() {
        assert!(default_database_path().ends_with("gork.db"));
        assert!(default_database_url().starts_with("sqlite://"));
    }
}
