//! Error types shared across the storage boundary.

use thiserror::Error;

/// Errors surfaced by `WorkflowStore` implementations.
///
/// Busy/locked conditions are retried inside the implementation and never
/// reach callers as a distinct variant.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// A query failed or returned malformed data.
    #[error("query error: {0}")]
    Query(String),

    /// The database could not be opened or reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The caller passed a value the store rejects.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Encoding or decoding a persisted JSON column failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True when the error means the row simply was not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}
