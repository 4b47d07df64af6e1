//! Domain types for the gork workflow engine.
//!
//! This crate carries the shared vocabulary (workflows, steps, actions,
//! runs, statuses) and the duration-literal parsing used by workflow
//! documents. It performs no IO; the storage and execution layers build on
//! top of it.

pub mod duration;
pub mod error;
pub mod workflow;
