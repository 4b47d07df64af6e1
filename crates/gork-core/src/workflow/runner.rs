//! Action runners: process execution, HTTP requests, inline scripts.
//!
//! `StepRunner::run` dispatches on the step's action kind and always returns
//! the log lines it collected, alongside an error when the action failed or
//! was aborted. Cancellation kills the child process (or abandons the
//! request) and returns whatever output was produced first.

use std::collections::HashMap;
use std::process::Stdio;

use gork_types::workflow::{
    ActionKind, ExecAction, HttpAction, ScriptAction, WorkflowStep,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Result shape shared by all runners: collected logs plus the outcome.
pub type RunOutput = (Vec<String>, Result<(), StepError>);

/// Failure of a single step attempt.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step declares no action (cannot happen on validated workflows).
    #[error("step defines no action")]
    MissingAction,

    /// The child process could not be spawned or waited on.
    #[error("exec failed: {0}")]
    Spawn(String),

    /// The child process exited non-zero. A negative code means it was
    /// terminated by a signal.
    #[error("exec failed: exit status {code}")]
    NonZeroExit { code: i32 },

    /// The HTTP request could not be built or sent.
    #[error("http request failed: {0}")]
    Request(String),

    /// The HTTP response carried an error status.
    #[error("http error: {0}")]
    HttpStatus(u16),

    /// The attempt was aborted through its cancellation token.
    #[error("step canceled")]
    Canceled,
}

/// Executes one step action.
#[derive(Clone)]
pub struct StepRunner {
    http: reqwest::Client,
}

impl StepRunner {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Run the step's action to completion, cancellation or failure.
    pub async fn run(&self, cancel: &CancellationToken, step: &WorkflowStep) -> RunOutput {
        match step.action_kind() {
            Some(ActionKind::Exec) => match &step.exec {
                Some(exec) => run_exec(cancel, step, exec).await,
                None => (Vec::new(), Err(StepError::MissingAction)),
            },
            Some(ActionKind::Http) => match &step.http {
                Some(http) => self.run_http(cancel, step, http).await,
                None => (Vec::new(), Err(StepError::MissingAction)),
            },
            Some(ActionKind::Script) => match &step.script {
                Some(script) => run_script(cancel, step, script).await,
                None => (Vec::new(), Err(StepError::MissingAction)),
            },
            None => (Vec::new(), Err(StepError::MissingAction)),
        }
    }

    // -----------------------------------------------------------------------
    // HTTP
    // -----------------------------------------------------------------------

    async fn run_http(
        &self,
        cancel: &CancellationToken,
        step: &WorkflowStep,
        http: &HttpAction,
    ) -> RunOutput {
        let method_name = if http.method.is_empty() {
            "GET".to_string()
        } else {
            http.method.to_uppercase()
        };
        let method = match reqwest::Method::from_bytes(method_name.as_bytes()) {
            Ok(m) => m,
            Err(e) => return (Vec::new(), Err(StepError::Request(e.to_string()))),
        };

        let url = interpolate(&http.url, &step.env);
        let body = interpolate(&http.body, &step.env);

        let mut request = self.http.request(method, &url);
        for (name, value) in &http.headers {
            request = request.header(name, interpolate(value, &step.env));
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = tokio::select! {
            result = request.send() => match result {
                Ok(r) => r,
                Err(e) => return (Vec::new(), Err(StepError::Request(e.to_string()))),
            },
            _ = cancel.cancelled() => return (Vec::new(), Err(StepError::Canceled)),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body_bytes = tokio::select! {
            result = response.bytes() => match result {
                Ok(b) => b,
                Err(e) => return (Vec::new(), Err(StepError::Request(e.to_string()))),
            },
            _ = cancel.cancelled() => return (Vec::new(), Err(StepError::Canceled)),
        };

        let mut logs = vec![
            format!("HTTP {method_name} {url} -> {status}"),
            format!("HTTP_STATUS:{status}"),
            format!("HTTP_BODY:{}", String::from_utf8_lossy(&body_bytes)),
        ];
        for name in headers.keys() {
            let joined = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(",");
            let upper = name.as_str().to_uppercase().replace('-', "_");
            logs.push(format!("HTTP_HEADER_{upper}:{joined}"));
        }

        if status >= 400 {
            (logs, Err(StepError::HttpStatus(status)))
        } else {
            (logs, Ok(()))
        }
    }
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

async fn run_exec(
    cancel: &CancellationToken,
    step: &WorkflowStep,
    exec: &ExecAction,
) -> RunOutput {
    // Arguments see `${VAR}` substitution against the step environment, so
    // resolved inputs reach commands that are not launched through a shell.
    let args: Vec<String> = exec
        .args
        .iter()
        .map(|arg| interpolate(arg, &step.env))
        .collect();

    let mut cmd = Command::new(&exec.command);
    cmd.args(&args)
        // The working directory is pinned to the engine's own; the validated
        // `working_dir` setting is not honored at execution time.
        .current_dir(".")
        .env_clear();

    // Scratch environment: step env first, action env second (wins on
    // conflict), both filtered against shell metacharacters.
    for (key, value) in step.env.iter().chain(exec.env.iter()) {
        if env_entry_ok(key, value) {
            cmd.env(key, value);
        }
    }

    run_command(cancel, cmd).await
}

fn env_entry_ok(key: &str, value: &str) -> bool {
    !key.contains(['=', ';', '|'])
        && !value.contains(['|', '&', ';', '`'])
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

async fn run_script(
    cancel: &CancellationToken,
    step: &WorkflowStep,
    script: &ScriptAction,
) -> RunOutput {
    let shell = if script.language.is_empty() {
        "sh"
    } else {
        &script.language
    };

    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(&script.inline);
    // Scripts inherit the process environment, extended with the step's.
    for (key, value) in &step.env {
        cmd.env(key, value);
    }

    run_command(cancel, cmd).await
}

// ---------------------------------------------------------------------------
// Shared child-process plumbing
// ---------------------------------------------------------------------------

async fn run_command(cancel: &CancellationToken, mut cmd: Command) -> RunOutput {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (Vec::new(), Err(StepError::Spawn(e.to_string()))),
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_stream(stdout));
    let stderr_task = tokio::spawn(read_stream(stderr));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let logs = collect_logs(stdout_task, stderr_task).await;
            return (logs, Err(StepError::Canceled));
        }
    };

    let logs = collect_logs(stdout_task, stderr_task).await;
    match status {
        Ok(status) if status.success() => (logs, Ok(())),
        Ok(status) => (
            logs,
            Err(StepError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            }),
        ),
        Err(e) => (logs, Err(StepError::Spawn(e.to_string()))),
    }
}

async fn read_stream(stream: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

async fn collect_logs(
    stdout_task: tokio::task::JoinHandle<Vec<u8>>,
    stderr_task: tokio::task::JoinHandle<Vec<u8>>,
) -> Vec<String> {
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let mut logs = Vec::new();
    append_lines(&mut logs, &stdout);
    append_lines(&mut logs, &stderr);
    logs
}

fn append_lines(logs: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        logs.extend(trimmed.lines().map(str::to_string));
    }
}

/// Literal `${VAR}` substitution against the step environment.
fn interpolate(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in env {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn exec_step(command: &str, args: Vec<&str>) -> WorkflowStep {
        WorkflowStep {
            name: "test".to_string(),
            exec: Some(ExecAction {
                command: command.to_string(),
                args: args.into_iter().map(String::from).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn script_step(inline: &str) -> WorkflowStep {
        WorkflowStep {
            name: "test".to_string(),
            script: Some(ScriptAction {
                language: String::new(),
                inline: inline.to_string(),
            }),
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------
    // Exec
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn exec_collects_stdout_lines() {
        let runner = StepRunner::new();
        let step = exec_step("echo", vec!["hello"]);
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(result.is_ok());
        assert_eq!(logs, vec!["hello"]);
    }

    #[tokio::test]
    async fn exec_orders_stdout_before_stderr() {
        let runner = StepRunner::new();
        let step = exec_step("sh", vec!["-c", "echo out; echo err 1>&2"]);
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(result.is_ok());
        assert_eq!(logs, vec!["out", "err"]);
    }

    #[tokio::test]
    async fn exec_nonzero_exit_is_failure_with_logs() {
        let runner = StepRunner::new();
        let step = exec_step("sh", vec!["-c", "echo before; exit 3"]);
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert_eq!(logs, vec!["before"]);
        match result {
            Err(StepError::NonZeroExit { code }) => assert_eq!(code, 3),
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_builds_scratch_environment_with_filtering() {
        let runner = StepRunner::new();
        let mut step = exec_step("sh", vec!["-c", r#"echo "$GOOD-$BAD-$HOME""#]);
        step.env.insert("GOOD".to_string(), "ok".to_string());
        step.env.insert("BAD".to_string(), "x|y".to_string());
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(result.is_ok());
        // BAD is filtered for its metacharacter; HOME is absent because the
        // environment is built from scratch.
        assert_eq!(logs, vec!["ok--"]);
    }

    #[tokio::test]
    async fn exec_action_env_overrides_step_env() {
        let runner = StepRunner::new();
        let mut step = exec_step("sh", vec!["-c", "echo $WHO"]);
        step.env.insert("WHO".to_string(), "step".to_string());
        step.exec.as_mut().unwrap().env = HashMap::from([(
            "WHO".to_string(),
            "action".to_string(),
        )]);
        let (logs, _) = runner.run(&CancellationToken::new(), &step).await;
        assert_eq!(logs, vec!["action"]);
    }

    #[tokio::test]
    async fn exec_interpolates_args_from_env() {
        let runner = StepRunner::new();
        let mut step = exec_step("echo", vec!["${MSG}"]);
        step.env.insert("MSG".to_string(), "resolved".to_string());
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(result.is_ok());
        assert_eq!(logs, vec!["resolved"]);
    }

    #[tokio::test]
    async fn exec_missing_command_is_spawn_error() {
        let runner = StepRunner::new();
        let step = exec_step("definitely-not-a-command-anywhere", vec![]);
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(logs.is_empty());
        assert!(matches!(result, Err(StepError::Spawn(_))));
    }

    // -------------------------------------------------------------------
    // Script
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn script_defaults_to_sh_and_sees_step_env() {
        let runner = StepRunner::new();
        let mut step = script_step("echo $MSG");
        step.env.insert("MSG".to_string(), "hi".to_string());
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(result.is_ok());
        assert_eq!(logs, vec!["hi"]);
    }

    #[tokio::test]
    async fn script_inherits_process_environment() {
        let runner = StepRunner::new();
        // PATH is always present in the test process.
        let (logs, result) = runner
            .run(&CancellationToken::new(), &script_step("echo ${PATH:+set}"))
            .await;
        assert!(result.is_ok());
        assert_eq!(logs, vec!["set"]);
    }

    #[tokio::test]
    async fn cancellation_kills_child_promptly() {
        let runner = StepRunner::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let (_logs, result) = runner.run(&cancel, &script_step("sleep 5")).await;
        assert!(matches!(result, Err(StepError::Canceled)));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "cancellation should be prompt, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_output() {
        let runner = StepRunner::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let (logs, result) = runner
            .run(&cancel, &script_step("echo early; sleep 5; echo late"))
            .await;
        assert!(matches!(result, Err(StepError::Canceled)));
        assert_eq!(logs, vec!["early"]);
    }

    // -------------------------------------------------------------------
    // HTTP
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn http_success_produces_structured_logs() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items")
            .with_status(200)
            .with_header("x-request-id", "abc123")
            .with_body(r#"{"total":2}"#)
            .create_async()
            .await;

        let runner = StepRunner::new();
        let step = WorkflowStep {
            name: "fetch".to_string(),
            http: Some(HttpAction {
                method: String::new(),
                url: format!("{}/items", server.url()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        mock.assert_async().await;
        assert!(result.is_ok());
        assert_eq!(logs[0], format!("HTTP GET {}/items -> 200", server.url()));
        assert_eq!(logs[1], "HTTP_STATUS:200");
        assert_eq!(logs[2], r#"HTTP_BODY:{"total":2}"#);
        assert!(
            logs.iter().any(|l| l == "HTTP_HEADER_X_REQUEST_ID:abc123"),
            "missing header line in {logs:?}"
        );
    }

    #[tokio::test]
    async fn http_error_status_is_failure_with_logs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("nope")
            .create_async()
            .await;

        let runner = StepRunner::new();
        let step = WorkflowStep {
            name: "fetch".to_string(),
            http: Some(HttpAction {
                url: format!("{}/missing", server.url()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(matches!(result, Err(StepError::HttpStatus(404))));
        assert!(logs.contains(&"HTTP_STATUS:404".to_string()));
        assert!(logs.contains(&"HTTP_BODY:nope".to_string()));
    }

    #[tokio::test]
    async fn http_interpolates_url_body_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items/42")
            .match_header("x-token", "secret-7")
            .match_body("id=42")
            .with_status(201)
            .create_async()
            .await;

        let runner = StepRunner::new();
        let step = WorkflowStep {
            name: "push".to_string(),
            env: HashMap::from([
                ("ITEM".to_string(), "42".to_string()),
                ("TOKEN".to_string(), "secret-7".to_string()),
            ]),
            http: Some(HttpAction {
                method: "post".to_string(),
                url: format!("{}/items/${{ITEM}}", server.url()),
                headers: HashMap::from([(
                    "x-token".to_string(),
                    "${TOKEN}".to_string(),
                )]),
                body: "id=${ITEM}".to_string(),
            }),
            ..Default::default()
        };

        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        mock.assert_async().await;
        assert!(result.is_ok());
        assert!(logs[0].starts_with("HTTP POST"));
        assert!(logs[0].contains("/items/42"));
    }

    #[tokio::test]
    async fn http_unreachable_host_is_request_error() {
        let runner = StepRunner::new();
        let step = WorkflowStep {
            name: "fetch".to_string(),
            http: Some(HttpAction {
                url: "http://127.0.0.1:1/unreachable".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (logs, result) = runner.run(&CancellationToken::new(), &step).await;
        assert!(logs.is_empty());
        assert!(matches!(result, Err(StepError::Request(_))));
    }

    // -------------------------------------------------------------------
    // Interpolation helper
    // -------------------------------------------------------------------

    #[test]
    fn interpolate_is_literal_replacement() {
        let env = HashMap::from([("A".to_string(), "1".to_string())]);
        assert_eq!(interpolate("x=${A};y=${B}", &env), "x=1;y=${B}");
    }
}
