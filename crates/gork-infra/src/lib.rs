//! Infrastructure layer for the gork workflow engine.
//!
//! Implements the `gork-core` storage port with SQLite (sqlx, WAL mode,
//! split reader/writer pools) and provides the default on-disk database
//! location.

pub mod sqlite;

pub use sqlite::{default_database_path, default_database_url, DatabasePool, SqliteStore};
