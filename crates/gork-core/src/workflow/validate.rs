//! Structural workflow validation.
//!
//! Validation is total and runs before any persistence mutation: a workflow
//! that reaches the store has a non-empty, uniquely-named step list, exactly
//! one action per step, resolvable acyclic dependencies, well-formed input
//! bindings, and exec commands that clear the allow/deny lists.

use std::collections::HashSet;
use std::path::{Component, Path};

use gork_types::workflow::{ExecAction, HttpAction, ScriptAction, Workflow, WorkflowStep};

use super::dag::ensure_acyclic;
use super::WorkflowError;

// ---------------------------------------------------------------------------
// Command allow/deny lists
// ---------------------------------------------------------------------------

/// Commands runnable by bare name. Anything else must be path-qualified.
const ALLOWED_COMMANDS: &[&str] = &[
    // Shells
    "cmd", "powershell", "bash", "sh", "curl", "wget",
    // Development tools
    "go", "python", "python3", "npm", "node", "javac", "java",
    // Build tools
    "make", "cmake", "gcc", "g++", "clang",
    // Version control
    "git",
    // File operations
    "cp", "mv", "rm", "mkdir", "ls", "dir", "type", "cat", "echo", "find", "grep",
    // Windows specific
    "robocopy", "xcopy", "del", "timeout",
];

/// Commands rejected outright, even when they would match the allow-list or
/// arrive path-qualified by name.
const DENIED_COMMANDS: &[&str] = &[
    // Privilege elevation
    "sudo", "su", "runas", "elevate", "pkexec", "gksu", "kdesu", "beesu",
    // Permission and account changes
    "chmod", "chown", "passwd", "usermod",
    // Disks and devices
    "mount", "umount", "fdisk", "mkfs", "dd",
    // Power and service management
    "shutdown", "reboot", "halt", "poweroff", "systemctl", "service", "init", "telinit",
    // Job scheduling
    "crontab", "at",
    // Remote access and raw sockets
    "ssh", "scp", "sftp", "ftp", "nc", "ncat", "socat",
    // Introspection and process control
    "netstat", "ss", "lsof", "ps", "top", "htop", "kill", "killall", "pkill", "taskkill",
];

fn on_list(list: &[&str], command: &str) -> bool {
    list.iter().any(|entry| entry.eq_ignore_ascii_case(command))
}

// ---------------------------------------------------------------------------
// Workflow validation
// ---------------------------------------------------------------------------

/// Validate a complete workflow.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow name is required".to_string(),
        ));
    }
    if workflow.steps.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must contain at least one step".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for step in &workflow.steps {
        if !names.insert(step.name.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
        validate_step(step)
            .map_err(|e| wrap_step_error(&step.name, e))?;
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' cannot depend on itself",
                    step.name
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    ensure_acyclic(&workflow.steps)
}

fn wrap_step_error(step: &str, err: WorkflowError) -> WorkflowError {
    match err {
        WorkflowError::Validation(msg) => {
            WorkflowError::Validation(format!("step '{step}': {msg}"))
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Step validation
// ---------------------------------------------------------------------------

fn validate_step(step: &WorkflowStep) -> Result<(), WorkflowError> {
    if step.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "step name is required".to_string(),
        ));
    }

    let action_count = [
        step.exec.is_some(),
        step.http.is_some(),
        step.script.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if action_count == 0 {
        return Err(WorkflowError::Validation(
            "step must define exactly one action".to_string(),
        ));
    }
    if action_count > 1 {
        return Err(WorkflowError::Validation(
            "only one action may be defined per step".to_string(),
        ));
    }

    if let Some(exec) = &step.exec {
        validate_exec(exec)?;
    }
    if let Some(http) = &step.http {
        validate_http(http)?;
    }
    if let Some(script) = &step.script {
        validate_script(script)?;
    }

    for key in step.env.keys() {
        if key.contains('=') {
            return Err(WorkflowError::Validation(format!(
                "environment variable key '{key}' cannot contain '='"
            )));
        }
    }

    for (input_key, input_spec) in &step.inputs {
        if input_spec.split('.').count() != 2 {
            return Err(WorkflowError::Validation(format!(
                "input '{input_key}' must be in format 'step_name.key_name'"
            )));
        }
        if input_key.contains('=') || input_key.contains(';') || input_key.contains('|') {
            return Err(WorkflowError::Validation(format!(
                "input key '{input_key}' contains invalid characters"
            )));
        }
    }

    let mut seen_deps = HashSet::new();
    for dep in &step.depends_on {
        if dep.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "dependency names must be non-empty".to_string(),
            ));
        }
        if !seen_deps.insert(dep.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate dependency '{dep}'"
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Action validation
// ---------------------------------------------------------------------------

fn validate_exec(exec: &ExecAction) -> Result<(), WorkflowError> {
    let command = exec.command.trim();
    if command.is_empty() {
        return Err(WorkflowError::Validation(
            "exec command is required".to_string(),
        ));
    }

    if on_list(DENIED_COMMANDS, command) {
        return Err(WorkflowError::Validation(format!(
            "command '{command}' is not allowed for security reasons"
        )));
    }

    let is_local = command.starts_with("./") || command.starts_with(".\\");
    let is_path_based = command.contains('/') || command.contains('\\');
    if !on_list(ALLOWED_COMMANDS, command)
        && !Path::new(command).is_absolute()
        && !is_path_based
        && !is_local
    {
        return Err(WorkflowError::Validation(format!(
            "command '{command}' is not in the allowed commands list"
        )));
    }

    if !exec.working_dir.is_empty() {
        let dir = Path::new(&exec.working_dir);
        if dir.is_absolute() {
            return Err(WorkflowError::Validation(
                "absolute working directories are not allowed".to_string(),
            ));
        }
        if dir.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(WorkflowError::Validation(
                "working directory cannot contain '..'".to_string(),
            ));
        }
    }

    for key in exec.env.keys() {
        if key.contains('=') {
            return Err(WorkflowError::Validation(format!(
                "environment variable key '{key}' cannot contain '='"
            )));
        }
    }

    Ok(())
}

fn validate_http(http: &HttpAction) -> Result<(), WorkflowError> {
    if http.url.trim().is_empty() {
        return Err(WorkflowError::Validation("http url is required".to_string()));
    }
    Ok(())
}

fn validate_script(script: &ScriptAction) -> Result<(), WorkflowError> {
    if script.inline.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "script inline content is required".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
