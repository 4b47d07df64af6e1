//! Storage trait for workflows, runs, step runs and step data.
//!
//! This is the port the engine and scheduler are written against; the
//! infrastructure layer (gork-infra) implements it with SQLite. Uses native
//! async fn in traits (no async_trait macro).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gork_types::error::StoreError;
use gork_types::workflow::{Run, RunStatus, StepRun, StepStatus, Workflow};

/// Durable persistence contract.
///
/// Implementations must be safe for concurrent use from many tasks; the
/// write-heavy operations (run/step-run inserts and updates, `append_logs`,
/// the delete/reset cascades) are expected to retry transparently on
/// busy/locked conditions. `append_logs` must be atomic with respect to
/// concurrent callers for the same step run.
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow by name, preserving `created_at` on replace.
    /// Returns the persisted id.
    fn insert_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Get a workflow (with steps) by id. `StoreError::NotFound` if absent.
    fn get_workflow(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<Workflow, StoreError>> + Send;

    /// Get a workflow (with steps) by name. `StoreError::NotFound` if absent.
    fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Workflow, StoreError>> + Send;

    /// All workflows, ordered by name.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, StoreError>> + Send;

    /// Cascade-delete a workflow: step data, step runs, runs, then the
    /// workflow row. Idempotent; each phase retried under contention.
    fn delete_workflow(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// The same cascade, applied to every row in the store.
    fn reset_all_data(
        &self,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run, returning its new id.
    fn insert_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Update a run's status and (optionally) completion time.
    fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Get a single run by id.
    fn get_run(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<Run, StoreError>> + Send;

    /// Runs ordered by `created_at` descending, optionally filtered by
    /// workflow.
    fn list_runs(
        &self,
        workflow_id: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Step runs
    // -----------------------------------------------------------------------

    /// Insert a step run, returning its new id.
    fn insert_step_run(
        &self,
        step_run: &StepRun,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Update a step run's status, attempt count, completion time, error and
    /// log snapshot.
    fn update_step_run(
        &self,
        id: i64,
        status: StepStatus,
        attempt: u32,
        completed_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        logs: &[String],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Append log lines to a step run, atomically.
    fn append_logs(
        &self,
        step_run_id: i64,
        lines: &[String],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Step runs for a run, ordered by `started_at` ascending.
    fn get_step_runs(
        &self,
        run_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Step data
    // -----------------------------------------------------------------------

    /// Upsert an output value under `(run_id, step_name, key)`.
    fn store_step_data(
        &self,
        run_id: i64,
        step_name: &str,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Fetch a single output value.
    fn get_step_data(
        &self,
        run_id: i64,
        step_name: &str,
        key: &str,
    ) -> impl std::future::Future<Output = Result<String, StoreError>> + Send;

    /// All outputs for a run, keyed by step name then output key.
    fn get_all_step_data(
        &self,
        run_id: i64,
    ) -> impl std::future::Future<Output = Result<HashMap<String, HashMap<String, String>>, StoreError>>
    + Send;
}

/// Longest value accepted by `store_step_data`.
pub const MAX_STEP_DATA_VALUE_LEN: usize = 10_000;
