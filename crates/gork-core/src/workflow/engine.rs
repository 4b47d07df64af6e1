//! Workflow execution engine.
//!
//! `Engine::execute` turns a validated workflow into a durable run: one
//! worker task per step, each blocked on its dependencies' completion
//! signals, with retries, per-attempt timeouts, atomic log appends and
//! output extraction. Every state transition is persisted through the store
//! before the completion signal fires, so dependents always observe a
//! consistent post-state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use gork_types::error::StoreError;
use gork_types::workflow::{Run, RunStatus, StepRun, StepStatus, Workflow, WorkflowStep};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::extract;
use super::loader;
use super::runner::{StepError, StepRunner};
use super::validate::validate_workflow;
use super::WorkflowError;
use crate::store::WorkflowStore;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run row could not be inserted or transitioned before any step
    /// worker ran.
    #[error("failed to start run: {0}")]
    Start(StoreError),

    /// At least one step finished non-successfully; names the first failing
    /// step.
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    /// Execution was canceled through the caller's token; affected rows are
    /// left in their last persisted state.
    #[error("run canceled")]
    Canceled,

    /// A store operation failed mid-run.
    #[error("store error: {0}")]
    Store(StoreError),

    /// A worker task died without reporting a result.
    #[error("worker task failed: {0}")]
    Join(String),

    /// Loading or validating a workflow failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Dependency-aware workflow executor over a durable store.
pub struct Engine<R> {
    store: Arc<R>,
    runner: StepRunner,
    /// Serializes StepRun mutations across workers of the same engine.
    step_lock: Arc<Mutex<()>>,
}

impl<R: WorkflowStore + 'static> Engine<R> {
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            runner: StepRunner::new(),
            step_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load and validate a workflow document from a restricted path.
    pub fn load_workflow(&self, path: &str) -> Result<Workflow, EngineError> {
        Ok(loader::load_workflow(path)?)
    }

    /// Validate and upsert a workflow; returns the persisted id.
    pub async fn create_workflow(&self, workflow: &Workflow) -> Result<i64, EngineError> {
        validate_workflow(workflow)?;
        self.store
            .insert_workflow(workflow)
            .await
            .map_err(EngineError::Store)
    }

    /// Cascade-delete a workflow and its audit trail.
    pub async fn delete_workflow(&self, id: i64) -> Result<(), EngineError> {
        self.store.delete_workflow(id).await.map_err(EngineError::Store)
    }

    /// Wipe every row in the store.
    pub async fn reset_all_data(&self) -> Result<(), EngineError> {
        self.store.reset_all_data().await.map_err(EngineError::Store)
    }

    /// Execute a workflow, recording a run and one step run per executed
    /// step. Returns the terminal run on success or a `StepFailed` naming
    /// the first failing step.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        trigger: &str,
    ) -> Result<Run, EngineError> {
        let now = Utc::now();
        let mut run = Run {
            id: 0,
            workflow_id: workflow.id,
            status: RunStatus::Pending,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
            trigger: trigger.to_string(),
        };
        run.id = self
            .store
            .insert_run(&run)
            .await
            .map_err(EngineError::Start)?;
        self.store
            .update_run_status(run.id, RunStatus::Running, None)
            .await
            .map_err(EngineError::Start)?;
        run.status = RunStatus::Running;

        tracing::info!(
            run_id = run.id,
            workflow = workflow.name.as_str(),
            trigger,
            steps = workflow.steps.len(),
            "starting run"
        );

        // One single-fire completion signal per step; a worker publishes it
        // after its terminal store update, and dropping the sender (early
        // exit) unblocks dependents the same way.
        let mut senders: HashMap<String, watch::Sender<bool>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        for step in &workflow.steps {
            let (tx, rx) = watch::channel(false);
            senders.insert(step.name.clone(), tx);
            receivers.insert(step.name.clone(), rx);
        }

        let mut workers = JoinSet::new();
        for step in workflow.steps.iter().cloned() {
            let deps: Vec<watch::Receiver<bool>> = step
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).cloned())
                .collect();
            let Some(done) = senders.remove(&step.name) else {
                continue;
            };
            let worker = StepWorker {
                store: Arc::clone(&self.store),
                runner: self.runner.clone(),
                lock: Arc::clone(&self.step_lock),
                cancel: cancel.clone(),
                run_id: run.id,
            };
            workers.spawn(worker.run(step, deps, done));
        }
        drop(receivers);

        let mut first_failure: Option<EngineError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(EngineError::Canceled)) => {}
                Ok(Err(err)) => {
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_failure.is_none() {
                        first_failure = Some(EngineError::Join(join_err.to_string()));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!(run_id = run.id, "run canceled");
            return Err(EngineError::Canceled);
        }

        let step_runs = self
            .store
            .get_step_runs(run.id)
            .await
            .map_err(EngineError::Store)?;
        let all_success = step_runs.len() == workflow.steps.len()
            && step_runs.iter().all(|sr| sr.status == StepStatus::Success);
        let final_status = if first_failure.is_none() && all_success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        let completed = Utc::now();
        self.store
            .update_run_status(run.id, final_status, Some(completed))
            .await
            .map_err(EngineError::Store)?;
        run.status = final_status;
        run.completed_at = Some(completed);
        run.updated_at = completed;

        tracing::info!(
            run_id = run.id,
            workflow = workflow.name.as_str(),
            status = %final_status,
            "run finished"
        );

        match first_failure {
            Some(err) => Err(err),
            None => Ok(run),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-step worker
// ---------------------------------------------------------------------------

struct StepWorker<R> {
    store: Arc<R>,
    runner: StepRunner,
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    run_id: i64,
}

impl<R: WorkflowStore> StepWorker<R> {
    async fn run(
        self,
        step: WorkflowStep,
        deps: Vec<watch::Receiver<bool>>,
        done: watch::Sender<bool>,
    ) -> Result<(), EngineError> {
        // Wait for every dependency to reach a terminal state. A receive
        // error means the dependency's worker exited early; its step either
        // failed or was never recorded, which downstream input resolution
        // will surface.
        for mut rx in deps {
            tokio::select! {
                result = rx.wait_for(|terminal| *terminal) => { let _ = result; }
                _ = self.cancel.cancelled() => return Err(EngineError::Canceled),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        let step = self.resolve_inputs(step).await?;

        let now = Utc::now();
        let step_run = StepRun {
            id: 0,
            run_id: self.run_id,
            step_name: step.name.clone(),
            status: StepStatus::Pending,
            attempt: 0,
            started_at: Some(now),
            completed_at: None,
            error: None,
            logs: Vec::new(),
        };
        let step_run_id = {
            let _guard = self.lock.lock().await;
            self.store
                .insert_step_run(&step_run)
                .await
                .map_err(EngineError::Store)?
        };
        self.update_step(step_run_id, StepStatus::Running, 0, None, None, &[])
            .await?;

        let mut logs_acc: Vec<String> = Vec::new();
        let mut attempt = 0u32;
        let mut timed_out = false;
        let last_err: StepError;

        loop {
            if attempt > 0 {
                self.update_step(step_run_id, StepStatus::Retrying, attempt, None, None, &logs_acc)
                    .await?;
                tokio::select! {
                    _ = tokio::time::sleep(step.retry_delay) => {}
                    _ = self.cancel.cancelled() => return Err(EngineError::Canceled),
                }
            }

            // Per-attempt token: a child of the run token, additionally
            // cancelled by the timeout guard when a deadline is configured.
            let attempt_token = self.cancel.child_token();
            let timeout_guard = if step.timeout.is_zero() {
                None
            } else {
                let token = attempt_token.clone();
                let deadline = step.timeout;
                Some(tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(deadline) => token.cancel(),
                        _ = token.cancelled() => {}
                    }
                }))
            };

            let (logs, result) = self.runner.run(&attempt_token, &step).await;
            timed_out = !step.timeout.is_zero()
                && attempt_token.is_cancelled()
                && !self.cancel.is_cancelled();
            if let Some(guard) = timeout_guard {
                guard.abort();
            }

            for line in &logs {
                tracing::debug!(step = step.name.as_str(), attempt, line = line.as_str(), "step output");
            }
            logs_acc.extend(logs.iter().cloned());
            {
                let _guard = self.lock.lock().await;
                self.store
                    .append_logs(step_run_id, &logs)
                    .await
                    .map_err(EngineError::Store)?;
            }

            match result {
                Ok(()) => {
                    self.store_outputs(&step, &logs).await?;
                    self.update_step(
                        step_run_id,
                        StepStatus::Success,
                        attempt,
                        Some(Utc::now()),
                        None,
                        &logs_acc,
                    )
                    .await?;
                    done.send_replace(true);
                    return Ok(());
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Err(EngineError::Canceled);
                    }
                    if attempt < step.retries {
                        tracing::warn!(
                            step = step.name.as_str(),
                            attempt,
                            error = %err,
                            "attempt failed, retrying"
                        );
                        attempt += 1;
                        continue;
                    }
                    last_err = err;
                    break;
                }
            }
        }

        let status = if timed_out {
            StepStatus::Timeout
        } else {
            StepStatus::Failed
        };
        let message = last_err.to_string();
        self.update_step(
            step_run_id,
            status,
            attempt,
            Some(Utc::now()),
            Some(&message),
            &logs_acc,
        )
        .await?;
        // Dependents still get signaled; the engine aggregates failure at
        // run level.
        done.send_replace(true);

        tracing::warn!(step = step.name.as_str(), status = %status, error = %message, "step failed");
        Err(EngineError::StepFailed {
            step: step.name,
            error: message,
        })
    }

    /// Bind declared inputs into the step environment from upstream outputs.
    async fn resolve_inputs(&self, mut step: WorkflowStep) -> Result<WorkflowStep, EngineError> {
        if step.inputs.is_empty() {
            return Ok(step);
        }

        let data = self
            .store
            .get_all_step_data(self.run_id)
            .await
            .map_err(EngineError::Store)?;

        let inputs = step.inputs.clone();
        for (input_key, spec) in inputs {
            let Some((source, key)) = spec.split_once('.') else {
                return Err(EngineError::StepFailed {
                    step: step.name.clone(),
                    error: format!("invalid input spec '{spec}': expected 'step_name.key_name'"),
                });
            };
            let Some(outputs) = data.get(source) else {
                return Err(EngineError::StepFailed {
                    step: step.name.clone(),
                    error: format!("input '{input_key}' references non-existent step '{source}'"),
                });
            };
            let Some(value) = outputs.get(key) else {
                return Err(EngineError::StepFailed {
                    step: step.name.clone(),
                    error: format!(
                        "input '{input_key}' references non-existent output '{key}' from step '{source}'"
                    ),
                });
            };
            step.env.insert(input_key, value.clone());
        }
        Ok(step)
    }

    /// Persist extracted outputs from a successful attempt's logs.
    async fn store_outputs(&self, step: &WorkflowStep, logs: &[String]) -> Result<(), EngineError> {
        for (key, value) in extract::http_convenience_outputs(logs) {
            self.store
                .store_step_data(self.run_id, &step.name, &key, &value)
                .await
                .map_err(EngineError::Store)?;
        }
        for (output_key, rule) in &step.outputs {
            if let Some(value) = extract::resolve_output(rule, logs) {
                self.store
                    .store_step_data(self.run_id, &step.name, output_key, &value)
                    .await
                    .map_err(EngineError::Store)?;
            }
        }
        Ok(())
    }

    async fn update_step(
        &self,
        step_run_id: i64,
        status: StepStatus,
        attempt: u32,
        completed_at: Option<chrono::DateTime<Utc>>,
        error: Option<&str>,
        logs: &[String],
    ) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;
        self.store
            .update_step_run(step_run_id, status, attempt, completed_at, error, logs)
            .await
            .map_err(EngineError::Store)
    }
}
