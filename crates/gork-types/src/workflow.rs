//! Workflow domain types for gork.
//!
//! Defines the canonical representation of a workflow: a named DAG of steps,
//! each carrying exactly one action (exec, http or script). Execution
//! tracking types (`Run`, `StepRun`) and the status enums live here too, so
//! that the store, engine and scheduler all share one vocabulary.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::duration_str;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition.
///
/// `id`, `created_at` and `updated_at` are assigned by the store; YAML
/// documents only carry the declarative fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Store-assigned numeric identity.
    #[serde(default)]
    pub id: i64,
    /// Unique workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: String,
    /// Interval literal (e.g. `"30s"`); empty means never scheduled.
    #[serde(default)]
    pub schedule: String,
    /// Ordered step definitions forming the DAG.
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

// ---------------------------------------------------------------------------
// Steps and actions
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowStep {
    /// Step name, unique within the workflow and referenced by `depends_on`.
    pub name: String,
    /// Names of steps that must reach a terminal state before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Process-execution action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// HTTP-request action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpAction>,
    /// Inline-script action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptAction>,
    /// Environment variables handed to the action.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Input bindings: env var name -> `"<source_step>.<output_key>"`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    /// Output bindings: output key -> extraction rule.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    /// Per-attempt timeout; zero means unbounded.
    #[serde(with = "duration_str", default, skip_serializing_if = "Duration::is_zero")]
    pub timeout: Duration,
    /// Number of retries after the first attempt.
    #[serde(default)]
    pub retries: u32,
    /// Delay between attempts.
    #[serde(
        with = "duration_str",
        default,
        skip_serializing_if = "Duration::is_zero"
    )]
    pub retry_delay: Duration,
}

/// Launch a process with arguments.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecAction {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Relative working directory; ignored at execution time but validated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

/// Perform an HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpAction {
    /// HTTP method; empty means `GET`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// Run an inline script through an interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScriptAction {
    /// Interpreter name; empty means `sh`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    /// The script source.
    pub inline: String,
}

/// Discriminator over the closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Exec,
    Http,
    Script,
}

impl WorkflowStep {
    /// The kind of action this step defines, if any.
    ///
    /// Validation guarantees exactly one action on stored workflows; on
    /// unvalidated input the first of exec/http/script wins.
    pub fn action_kind(&self) -> Option<ActionKind> {
        if self.exec.is_some() {
            Some(ActionKind::Exec)
        } else if self.http.is_some() {
            Some(ActionKind::Http)
        } else if self.script.is_some() {
            Some(ActionKind::Script)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Timeout,
    Skipped,
}

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Timeout,
    Skipped,
    /// Transient state between failed attempts.
    Retrying,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success
                | RunStatus::Failed
                | RunStatus::Canceled
                | RunStatus::Timeout
                | RunStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Timeout => "timeout",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success
                | StepStatus::Failed
                | StepStatus::Canceled
                | StepStatus::Timeout
                | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Canceled => "canceled",
            StepStatus::Timeout => "timeout",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            "timeout" => Ok(RunStatus::Timeout),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "canceled" => Ok(StepStatus::Canceled),
            "timeout" => Ok(StepStatus::Timeout),
            "skipped" => Ok(StepStatus::Skipped),
            "retrying" => Ok(StepStatus::Retrying),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub workflow_id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    /// Free-form label naming what caused the run (`"cli"`, `"scheduler"`).
    #[serde(default)]
    pub trigger: String,
}

/// The persisted record for one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub run_id: i64,
    pub step_name: String,
    pub status: StepStatus,
    /// Zero-indexed count of retries consumed.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
