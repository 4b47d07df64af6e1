//! Workflow engine core: validation, loading, execution and scheduling.
//!
//! - `validate` -- structural validation and the command allow/deny lists
//! - `dag` -- dependency-graph cycle detection
//! - `loader` -- path-restricted YAML loading
//! - `runner` -- the three action runners (exec, http, script)
//! - `extract` -- output extraction from step logs
//! - `engine` -- dependency-aware fan-out execution with durable state
//! - `scheduler` -- interval timers, non-overlap, orphan recovery

pub mod dag;
pub mod engine;
pub mod extract;
pub mod loader;
pub mod runner;
pub mod scheduler;
pub mod validate;

use thiserror::Error;

/// Errors from loading or validating a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML deserialization failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("invalid workflow: {0}")]
    Validation(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected at step '{0}'")]
    Cycle(String),

    /// A step references a dependency that is not declared.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The document path escapes the allowed locations.
    #[error("restricted path: {0}")]
    RestrictedPath(String),

    /// Reading the document failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
