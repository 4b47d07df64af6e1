//! SQLite persistence: pool management and the `WorkflowStore`
//! implementation.

pub mod pool;
pub mod store;

pub use pool::{default_database_path, default_database_url, DatabasePool};
pub use store::SqliteStore;
