//! Core logic for the gork workflow engine.
//!
//! Defines the storage port (`WorkflowStore`) that the infrastructure layer
//! implements, and everything that runs on top of it: validation, loading,
//! the action runners, the execution engine and the scheduler.

pub mod store;
pub mod workflow;

pub use store::WorkflowStore;
pub use workflow::engine::{Engine, EngineError};
pub use workflow::loader::load_workflow;
pub use workflow::scheduler::Scheduler;
pub use workflow::WorkflowError;
