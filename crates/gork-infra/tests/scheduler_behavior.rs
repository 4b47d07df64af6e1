//! Scheduler integration tests: startup recovery, interval firing,
//! non-overlap and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gork_core::store::WorkflowStore;
use gork_core::Scheduler;
use gork_infra::SqliteStore;
use gork_types::workflow::{
    Run, RunStatus, ScriptAction, StepRun, StepStatus, Workflow, WorkflowStep,
};
use tokio_util::sync::CancellationToken;

async fn scratch_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("gork.db").display());
    let store = Arc::new(SqliteStore::open(&url).await.unwrap());
    (dir, store)
}

fn scripted_workflow(name: &str, schedule: &str, inline: &str) -> Workflow {
    Workflow {
        id: 0,
        name: name.to_string(),
        description: String::new(),
        schedule: schedule.to_string(),
        steps: vec![WorkflowStep {
            name: "work".to_string(),
            script: Some(ScriptAction {
                language: String::new(),
                inline: inline.to_string(),
            }),
            ..Default::default()
        }],
        created_at: Default::default(),
        updated_at: Default::default(),
    }
}

/// Spawn the scheduler loop; returns the handle and its root token.
fn start_scheduler(
    store: Arc<SqliteStore>,
    reconcile: Duration,
) -> (tokio::task::JoinHandle<()>, CancellationToken) {
    let scheduler = Arc::new(Scheduler::with_reconcile_interval(store, reconcile));
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { scheduler.run(token).await });
    (handle, cancel)
}

// ---------------------------------------------------------------------------
// S6: crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_normalizes_orphaned_runs() {
    let (_dir, store) = scratch_store().await;

    let mut wf = scripted_workflow("orphaned", "10s", "echo tick");
    wf.id = store.insert_workflow(&wf).await.unwrap();

    // Seed a run and step run a crashed process would have left behind.
    let orphan = Run {
        id: 0,
        workflow_id: wf.id,
        status: RunStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        trigger: "scheduler".to_string(),
    };
    let run_id = store.insert_run(&orphan).await.unwrap();
    let orphan_step = StepRun {
        id: 0,
        run_id,
        step_name: "work".to_string(),
        status: StepStatus::Running,
        attempt: 0,
        started_at: Some(Utc::now()),
        completed_at: None,
        error: None,
        logs: Vec::new(),
    };
    store.insert_step_run(&orphan_step).await.unwrap();

    let pending = Run {
        status: RunStatus::Pending,
        ..orphan.clone()
    };
    let pending_id = store.insert_run(&pending).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let recovered = store.get_run(run_id).await.unwrap();
    assert_eq!(recovered.status, RunStatus::Canceled);
    assert!(recovered.completed_at.is_some());
    let recovered_pending = store.get_run(pending_id).await.unwrap();
    assert_eq!(recovered_pending.status, RunStatus::Canceled);

    // The last run just "completed" at recovery time, so the next scheduled
    // run waits out the interval; nothing new inside the test window.
    assert_eq!(store.list_runs(Some(wf.id)).await.unwrap().len(), 2);

    cancel.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// S5: non-overlap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_runs_never_overlap() {
    let (_dir, store) = scratch_store().await;

    let mut wf = scripted_workflow("busy", "50ms", "sleep 0.3");
    wf.id = store.insert_workflow(&wf).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    cancel.cancel();
    handle.await.unwrap();

    let mut runs = store.list_runs(Some(wf.id)).await.unwrap();
    assert!(!runs.is_empty(), "expected at least one scheduled run");
    assert!(runs.len() <= 4, "expected at most 4 runs, got {}", runs.len());
    assert!(runs.iter().all(|r| r.trigger == "scheduler"));

    // Completed runs all succeeded; at most the final one was cut short by
    // shutdown and left unfinished.
    let unfinished = runs.iter().filter(|r| r.completed_at.is_none()).count();
    assert!(unfinished <= 1, "more than one unfinished run");
    for run in runs.iter().filter(|r| r.completed_at.is_some()) {
        assert_eq!(run.status, RunStatus::Success);
    }

    // No two completed runs overlap in [started_at, completed_at].
    runs.sort_by_key(|r| r.started_at);
    for pair in runs.windows(2) {
        if let Some(completed) = pair[0].completed_at {
            assert!(
                pair[1].started_at >= completed,
                "run {} started before run {} completed",
                pair[1].id,
                pair[0].id
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary: empty and unparseable schedules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_schedule_is_never_scheduled() {
    let (_dir, store) = scratch_store().await;

    let mut wf = scripted_workflow("manual-only", "", "echo tick");
    wf.id = store.insert_workflow(&wf).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(store.list_runs(Some(wf.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn unparseable_schedule_is_skipped_without_error() {
    let (_dir, store) = scratch_store().await;

    let mut bad = scripted_workflow("confused", "whenever", "echo tick");
    bad.id = store.insert_workflow(&bad).await.unwrap();
    let mut good = scripted_workflow("fine", "100ms", "echo tick");
    good.id = store.insert_workflow(&good).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    handle.await.unwrap();

    // The invalid schedule produced nothing; the valid one kept firing.
    assert!(store.list_runs(Some(bad.id)).await.unwrap().is_empty());
    assert!(!store.list_runs(Some(good.id)).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Shutdown cancels in-flight runs and drains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancels_in_flight_run_and_returns() {
    let (_dir, store) = scratch_store().await;

    let mut wf = scripted_workflow("long", "50ms", "sleep 10");
    wf.id = store.insert_workflow(&wf).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_secs(5));
    // Let the first run start.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    // run() must return promptly even though a 10s step was in flight.
    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("scheduler did not shut down in time")
        .unwrap();

    let runs = store.list_runs(Some(wf.id)).await.unwrap();
    assert_eq!(runs.len(), 1);
    // The interrupted run keeps its last persisted state until the next
    // startup recovery pass.
    assert_eq!(runs[0].status, RunStatus::Running);
}

// ---------------------------------------------------------------------------
// Reconcile picks up schedule removal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_removes_unscheduled_workflow() {
    let (_dir, store) = scratch_store().await;

    let mut wf = scripted_workflow("toggled", "100ms", "echo tick");
    wf.id = store.insert_workflow(&wf).await.unwrap();

    let (handle, cancel) = start_scheduler(Arc::clone(&store), Duration::from_millis(150));
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Clear the schedule; the next reconcile pass must stop the timer loop.
    wf.schedule = String::new();
    store.insert_workflow(&wf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let count_after_removal = store.list_runs(Some(wf.id)).await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let count_later = store.list_runs(Some(wf.id)).await.unwrap().len();
    assert_eq!(
        count_after_removal, count_later,
        "runs kept appearing after the schedule was cleared"
    );

    cancel.cancel();
    handle.await.unwrap();
}
