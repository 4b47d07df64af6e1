//! Interval scheduler for workflows with a `schedule` duration.
//!
//! Owns one task per scheduled workflow. Each task sleeps, executes, and
//! sleeps again, so runs of the same workflow never overlap. A reconcile
//! pass against the store picks up new, changed and deleted workflows; the
//! startup pass also normalizes runs orphaned by a crash to `canceled`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gork_types::duration::parse_duration;
use gork_types::workflow::{RunStatus, Workflow};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::Engine;
use crate::store::WorkflowStore;

/// How often the scheduler re-reads the store for workflow changes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns per-workflow interval schedules and their in-flight runs.
pub struct Scheduler<R> {
    store: Arc<R>,
    engine: Arc<Engine<R>>,
    reconcile_interval: Duration,
}

/// A live schedule: the task driving one workflow's interval loop.
struct ScheduleEntry {
    name: String,
    interval: Duration,
    /// Latest workflow snapshot; the task reads it before every run so step
    /// edits take effect without restarting the schedule.
    workflow_tx: watch::Sender<Workflow>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl<R: WorkflowStore + 'static> Scheduler<R> {
    pub fn new(store: Arc<R>) -> Self {
        Self::with_reconcile_interval(store, DEFAULT_RECONCILE_INTERVAL)
    }

    /// Override the reconcile cadence; useful when authored schedules are
    /// shorter than the default and edits must take effect promptly.
    pub fn with_reconcile_interval(store: Arc<R>, reconcile_interval: Duration) -> Self {
        let engine = Arc::new(Engine::new(Arc::clone(&store)));
        Self {
            store,
            engine,
            reconcile_interval,
        }
    }

    /// Run until `cancel` fires: recover orphans, install schedules, then
    /// reconcile periodically. Returns only after every schedule task (and
    /// any in-flight run) has wound down.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("scheduler starting");

        self.recover_orphans().await;

        let mut entries: HashMap<i64, ScheduleEntry> = HashMap::new();
        self.reconcile(&mut entries, &cancel).await;

        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick

        tracing::info!(scheduled = entries.len(), "scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile(&mut entries, &cancel).await,
            }
        }

        tracing::info!(scheduled = entries.len(), "scheduler shutting down");
        for (_, entry) in entries.drain() {
            stop_entry(entry).await;
        }
        tracing::info!("scheduler shutdown complete");
    }

    /// Normalize runs left `pending`/`running` by a previous process to
    /// `canceled`. This is the sole crash-recovery action; interrupted runs
    /// are not resumed.
    async fn recover_orphans(&self) {
        let runs = match self.store.list_runs(None).await {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!(error = %e, "failed to list runs during recovery");
                return;
            }
        };

        let mut recovered = 0usize;
        for run in runs {
            if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                match self
                    .store
                    .update_run_status(run.id, RunStatus::Canceled, Some(Utc::now()))
                    .await
                {
                    Ok(()) => {
                        recovered += 1;
                        tracing::info!(run_id = run.id, previous = %run.status, "recovered incomplete run");
                    }
                    Err(e) => {
                        tracing::error!(run_id = run.id, error = %e, "failed to cancel incomplete run");
                    }
                }
            }
        }

        tracing::info!(recovered, "recovery complete");
    }

    /// Bring the schedule map in line with the store.
    async fn reconcile(
        &self,
        entries: &mut HashMap<i64, ScheduleEntry>,
        root: &CancellationToken,
    ) {
        let workflows = match self.store.list_workflows().await {
            Ok(workflows) => workflows,
            Err(e) => {
                tracing::error!(error = %e, "failed to list workflows");
                return;
            }
        };

        let mut seen = HashSet::new();
        for workflow in workflows {
            seen.insert(workflow.id);

            let Some(interval) = parse_schedule(&workflow) else {
                if let Some(entry) = entries.remove(&workflow.id) {
                    tracing::info!(workflow = entry.name.as_str(), "removing schedule (no longer scheduled)");
                    stop_entry(entry).await;
                }
                continue;
            };

            match entries.get(&workflow.id).map(|e| e.interval) {
                Some(current) if current == interval => {
                    if let Some(entry) = entries.get(&workflow.id) {
                        entry.workflow_tx.send_replace(workflow);
                    }
                }
                Some(current) => {
                    tracing::info!(
                        workflow = workflow.name.as_str(),
                        old_interval = ?current,
                        new_interval = ?interval,
                        "updating workflow schedule"
                    );
                    if let Some(entry) = entries.remove(&workflow.id) {
                        stop_entry(entry).await;
                    }
                    self.install(entries, workflow, interval, root);
                }
                None => self.install(entries, workflow, interval, root),
            }
        }

        let stale: Vec<i64> = entries
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        for id in stale {
            if let Some(entry) = entries.remove(&id) {
                tracing::info!(workflow = entry.name.as_str(), "removing deleted workflow from scheduler");
                stop_entry(entry).await;
            }
        }
    }

    fn install(
        &self,
        entries: &mut HashMap<i64, ScheduleEntry>,
        workflow: Workflow,
        interval: Duration,
        root: &CancellationToken,
    ) {
        tracing::info!(
            workflow = workflow.name.as_str(),
            interval = ?interval,
            "scheduling workflow"
        );

        let token = root.child_token();
        let name = workflow.name.clone();
        let id = workflow.id;
        let (workflow_tx, workflow_rx) = watch::channel(workflow);
        let handle = tokio::spawn(run_schedule(
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            workflow_rx,
            interval,
            token.clone(),
        ));

        entries.insert(
            id,
            ScheduleEntry {
                name,
                interval,
                workflow_tx,
                token,
                handle,
            },
        );
    }
}

async fn stop_entry(entry: ScheduleEntry) {
    entry.token.cancel();
    let _ = entry.handle.await;
}

// ---------------------------------------------------------------------------
// Per-workflow schedule loop
// ---------------------------------------------------------------------------

async fn run_schedule<R: WorkflowStore + 'static>(
    store: Arc<R>,
    engine: Arc<Engine<R>>,
    workflow_rx: watch::Receiver<Workflow>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let workflow_id = workflow_rx.borrow().id;
    let delay = initial_delay(&*store, workflow_id, interval).await;
    tracing::debug!(workflow_id, initial_delay = ?delay, "schedule installed");
    if !sleep_unless_cancelled(delay, &cancel).await {
        return;
    }

    loop {
        let workflow = workflow_rx.borrow().clone();
        let run_token = cancel.child_token();

        tracing::info!(workflow = workflow.name.as_str(), "starting scheduled run");
        match engine.execute(&run_token, &workflow, "scheduler").await {
            Ok(run) => {
                tracing::info!(
                    workflow = workflow.name.as_str(),
                    run_id = run.id,
                    status = %run.status,
                    "scheduled run finished"
                );
            }
            Err(e) => {
                tracing::error!(workflow = workflow.name.as_str(), error = %e, "scheduled run failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        if !sleep_unless_cancelled(interval, &cancel).await {
            return;
        }
    }
}

/// Delay before the first scheduled run: fire immediately when the workflow
/// has never run, wait a full interval when the last run is still open, and
/// otherwise resume the cadence from the last completion.
async fn initial_delay<R: WorkflowStore>(store: &R, workflow_id: i64, interval: Duration) -> Duration {
    let runs = match store.list_runs(Some(workflow_id)).await {
        Ok(runs) => runs,
        Err(_) => return Duration::ZERO,
    };
    let Some(last) = runs.first() else {
        return Duration::ZERO;
    };
    let Some(completed_at) = last.completed_at else {
        return interval;
    };
    let elapsed = (Utc::now() - completed_at).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// A workflow's schedule as an interval, when it has a usable one.
fn parse_schedule(workflow: &Workflow) -> Option<Duration> {
    if workflow.schedule.is_empty() {
        return None;
    }
    match parse_duration(&workflow.schedule) {
        Ok(d) if !d.is_zero() => Some(d),
        Ok(_) => {
            tracing::warn!(
                workflow = workflow.name.as_str(),
                "ignoring zero-length schedule"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                workflow = workflow.name.as_str(),
                schedule = workflow.schedule.as_str(),
                error = %e,
                "invalid schedule duration"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
