//! SQLite implementation of the `WorkflowStore` trait.
//!
//! Workflow steps and step-run logs are stored as JSON text columns;
//! timestamps as RFC 3339 text (fixed microsecond precision, so
//! lexicographic order is chronological). Write-heavy operations retry on
//! busy/locked errors with exponential backoff; `append_logs` performs its
//! read-modify-write inside a single transaction on the writer connection.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use gork_core::store::{WorkflowStore, MAX_STEP_DATA_VALUE_LEN};
use gork_types::error::StoreError;
use gork_types::workflow::{Run, RunStatus, StepRun, StepStatus, Workflow, WorkflowStep};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) and migrate a store at the given URL.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = DatabasePool::new(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

// ---------------------------------------------------------------------------
// Busy retry
// ---------------------------------------------------------------------------

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || db.code().as_deref() == Some("5")
                || db.code().as_deref() == Some("517")
        }
        _ => false,
    }
}

/// Retry `op` on busy/locked errors: 5 attempts, 50ms base delay, doubling.
/// Non-busy errors surface immediately.
async fn retry_busy<T, F, Fut>(mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = BUSY_RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRY_ATTEMPTS => {
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Query(other.to_string()),
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime '{raw}': {e}")))
}

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: i64,
    name: String,
    description: String,
    schedule: String,
    steps: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            schedule: row.try_get("schedule")?,
            steps: row.try_get("steps")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, StoreError> {
        let steps: Vec<WorkflowStep> = serde_json::from_str(&self.steps)
            .map_err(|e| StoreError::Serialization(format!("invalid steps JSON: {e}")))?;
        Ok(Workflow {
            id: self.id,
            name: self.name,
            description: self.description,
            schedule: self.schedule,
            steps,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct RunRow {
    id: i64,
    workflow_id: i64,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
    trigger: String,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            trigger: row.try_get("trigger")?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        let status: RunStatus = self.status.parse().map_err(StoreError::Query)?;
        let started_at = match self.started_at.as_deref() {
            Some(raw) => parse_datetime(raw)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        Ok(Run {
            id: self.id,
            workflow_id: self.workflow_id,
            status,
            started_at,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            trigger: self.trigger,
        })
    }
}

struct StepRunRow {
    id: i64,
    run_id: i64,
    step_name: String,
    status: String,
    attempt: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    logs: String,
}

impl StepRunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            logs: row.try_get("logs")?,
        })
    }

    fn into_step_run(self) -> Result<StepRun, StoreError> {
        let status: StepStatus = self.status.parse().map_err(StoreError::Query)?;
        let logs: Vec<String> = serde_json::from_str(&self.logs)
            .map_err(|e| StoreError::Serialization(format!("invalid logs JSON: {e}")))?;
        Ok(StepRun {
            id: self.id,
            run_id: self.run_id,
            step_name: self.step_name,
            status,
            attempt: self.attempt as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error.filter(|e| !e.is_empty()),
            logs,
        })
    }
}

const WORKFLOW_COLUMNS: &str =
    "id, name, description, schedule, steps, created_at, updated_at";
const RUN_COLUMNS: &str =
    r#"id, workflow_id, status, started_at, completed_at, created_at, updated_at, "trigger""#;
const STEP_RUN_COLUMNS: &str =
    "id, run_id, step_name, status, attempt, started_at, completed_at, error, logs";

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<i64, StoreError> {
        let steps_json = serde_json::to_string(&workflow.steps)
            .map_err(|e| StoreError::Serialization(format!("serialize steps: {e}")))?;
        let now = format_datetime(&Utc::now());

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO workflows (name, description, schedule, steps, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                schedule = excluded.schedule,
                steps = excluded.steps,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.schedule)
        .bind(&steps_json)
        .bind(&now)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        Ok(id)
    }

    async fn get_workflow(&self, id: i64) -> Result<Workflow, StoreError> {
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        WorkflowRow::from_row(&row).map_err(map_sqlx)?.into_workflow()
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, StoreError> {
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE name = ?");
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        WorkflowRow::from_row(&row).map_err(map_sqlx)?.into_workflow()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY name");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| WorkflowRow::from_row(row).map_err(map_sqlx)?.into_workflow())
            .collect()
    }

    async fn delete_workflow(&self, id: i64) -> Result<(), StoreError> {
        // Cascade order matters: leaves first, each phase retried on its own.
        let phases = [
            "DELETE FROM step_data WHERE run_id IN (SELECT id FROM runs WHERE workflow_id = ?)",
            "DELETE FROM step_runs WHERE run_id IN (SELECT id FROM runs WHERE workflow_id = ?)",
            "DELETE FROM runs WHERE workflow_id = ?",
            "DELETE FROM workflows WHERE id = ?",
        ];
        for sql in phases {
            retry_busy(|| async move {
                sqlx::query(sql)
                    .bind(id)
                    .execute(&self.pool.writer)
                    .await
                    .map(|_| ())
            })
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn reset_all_data(&self) -> Result<(), StoreError> {
        let phases = [
            "DELETE FROM step_data",
            "DELETE FROM step_runs",
            "DELETE FROM runs",
            "DELETE FROM workflows",
        ];
        for sql in phases {
            retry_busy(|| async move {
                sqlx::query(sql).execute(&self.pool.writer).await.map(|_| ())
            })
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> Result<i64, StoreError> {
        let status = run.status.as_str();
        let started_at = format_datetime(&run.started_at);
        let completed_at = run.completed_at.as_ref().map(format_datetime);
        let now = format_datetime(&Utc::now());

        let started_ref = started_at.as_str();
        let completed_ref = completed_at.as_deref();
        let now_ref = now.as_str();
        let trigger = run.trigger.as_str();
        let workflow_id = run.workflow_id;

        retry_busy(|| async move {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO runs (workflow_id, status, started_at, completed_at, created_at, updated_at, "trigger")
                VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(workflow_id)
            .bind(status)
            .bind(started_ref)
            .bind(completed_ref)
            .bind(now_ref)
            .bind(now_ref)
            .bind(trigger)
            .fetch_one(&self.pool.writer)
            .await
        })
        .await
        .map_err(map_sqlx)
    }

    async fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let status = status.as_str();
        let completed = completed_at.as_ref().map(format_datetime);
        let now = format_datetime(&Utc::now());

        let completed_ref = completed.as_deref();
        let now_ref = now.as_str();

        retry_busy(|| async move {
            sqlx::query("UPDATE runs SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(completed_ref)
                .bind(now_ref)
                .bind(id)
                .execute(&self.pool.writer)
                .await
                .map(|_| ())
        })
        .await
        .map_err(map_sqlx)
    }

    async fn get_run(&self, id: i64) -> Result<Run, StoreError> {
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        RunRow::from_row(&row).map_err(map_sqlx)?.into_run()
    }

    async fn list_runs(&self, workflow_id: Option<i64>) -> Result<Vec<Run>, StoreError> {
        let rows = match workflow_id {
            Some(id) => {
                let query = format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_id = ? ORDER BY created_at DESC, id DESC"
                );
                sqlx::query(&query)
                    .bind(id)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let query =
                    format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, id DESC");
                sqlx::query(&query).fetch_all(&self.pool.reader).await
            }
        }
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(map_sqlx)?.into_run())
            .collect()
    }

    async fn insert_step_run(&self, step_run: &StepRun) -> Result<i64, StoreError> {
        let logs_json = serde_json::to_string(&step_run.logs)
            .map_err(|e| StoreError::Serialization(format!("serialize logs: {e}")))?;
        let started_at = step_run.started_at.as_ref().map(format_datetime);
        let completed_at = step_run.completed_at.as_ref().map(format_datetime);

        let run_id = step_run.run_id;
        let step_name = step_run.step_name.as_str();
        let status = step_run.status.as_str();
        let attempt = step_run.attempt as i64;
        let started_ref = started_at.as_deref();
        let completed_ref = completed_at.as_deref();
        let error_ref = step_run.error.as_deref();
        let logs_ref = logs_json.as_str();

        retry_busy(|| async move {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO step_runs (run_id, step_name, status, attempt, started_at, completed_at, error, logs)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(run_id)
            .bind(step_name)
            .bind(status)
            .bind(attempt)
            .bind(started_ref)
            .bind(completed_ref)
            .bind(error_ref)
            .bind(logs_ref)
            .fetch_one(&self.pool.writer)
            .await
        })
        .await
        .map_err(map_sqlx)
    }

    async fn update_step_run(
        &self,
        id: i64,
        status: StepStatus,
        attempt: u32,
        completed_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        logs: &[String],
    ) -> Result<(), StoreError> {
        let logs_json = serde_json::to_string(logs)
            .map_err(|e| StoreError::Serialization(format!("serialize logs: {e}")))?;
        let completed = completed_at.as_ref().map(format_datetime);

        let status = status.as_str();
        let attempt = attempt as i64;
        let completed_ref = completed.as_deref();
        let logs_ref = logs_json.as_str();

        retry_busy(|| async move {
            sqlx::query(
                "UPDATE step_runs SET status = ?, attempt = ?, completed_at = ?, error = ?, logs = ? WHERE id = ?",
            )
            .bind(status)
            .bind(attempt)
            .bind(completed_ref)
            .bind(error)
            .bind(logs_ref)
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map(|_| ())
        })
        .await
        .map_err(map_sqlx)
    }

    async fn append_logs(&self, step_run_id: i64, lines: &[String]) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }

        retry_busy(|| async move {
            let mut tx = self.pool.writer.begin().await?;

            let current: String = sqlx::query_scalar("SELECT logs FROM step_runs WHERE id = ?")
                .bind(step_run_id)
                .fetch_one(&mut *tx)
                .await?;

            let mut logs: Vec<String> = serde_json::from_str(&current).map_err(decode_err)?;
            logs.extend(lines.iter().cloned());
            let updated = serde_json::to_string(&logs).map_err(decode_err)?;

            sqlx::query("UPDATE step_runs SET logs = ? WHERE id = ?")
                .bind(&updated)
                .bind(step_run_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await
        })
        .await
        .map_err(map_sqlx)
    }

    async fn get_step_runs(&self, run_id: i64) -> Result<Vec<StepRun>, StoreError> {
        let query = format!(
            "SELECT {STEP_RUN_COLUMNS} FROM step_runs WHERE run_id = ? ORDER BY started_at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(run_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| StepRunRow::from_row(row).map_err(map_sqlx)?.into_step_run())
            .collect()
    }

    async fn store_step_data(
        &self,
        run_id: i64,
        step_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        if run_id <= 0 {
            return Err(StoreError::InvalidInput("invalid run ID".to_string()));
        }
        if step_name.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "step name cannot be empty".to_string(),
            ));
        }
        if key.trim().is_empty() {
            return Err(StoreError::InvalidInput("key cannot be empty".to_string()));
        }
        if value.len() > MAX_STEP_DATA_VALUE_LEN {
            return Err(StoreError::InvalidInput(format!(
                "value too large (max {MAX_STEP_DATA_VALUE_LEN} characters)"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO step_data (run_id, step_name, key, value)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run_id, step_name, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .bind(key)
        .bind(value)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_step_data(
        &self,
        run_id: i64,
        step_name: &str,
        key: &str,
    ) -> Result<String, StoreError> {
        sqlx::query_scalar("SELECT value FROM step_data WHERE run_id = ? AND step_name = ? AND key = ?")
            .bind(run_id)
            .bind(step_name)
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)
    }

    async fn get_all_step_data(
        &self,
        run_id: i64,
    ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
        let rows = sqlx::query("SELECT step_name, key, value FROM step_data WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        let mut data: HashMap<String, HashMap<String, String>> = HashMap::new();
        for row in rows {
            let step_name: String = row.try_get("step_name").map_err(map_sqlx)?;
            let key: String = row.try_get("key").map_err(map_sqlx)?;
            let value: String = row.try_get("value").map_err(map_sqlx)?;
            data.entry(step_name).or_default().insert(key, value);
        }
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
