//! Path-restricted loading of workflow YAML documents.
//!
//! Workflows are loaded from the `workflows/` directory (either path
//! separator) or as a bare filename in the current directory. Absolute paths
//! and parent-directory traversal are rejected before touching the
//! filesystem.

use std::path::Path;

use gork_types::workflow::Workflow;

use super::validate::validate_workflow;
use super::WorkflowError;

/// Check a document path against the allowed locations.
///
/// Accepts `workflows/<file>` (optionally prefixed `./` or `.\`, either
/// separator) and bare filenames; rejects absolute paths and any path
/// containing a `..` segment.
pub fn restricted_path(path: &str) -> Result<&Path, WorkflowError> {
    let raw = path.trim();
    if raw.is_empty() {
        return Err(WorkflowError::RestrictedPath(
            "empty workflow path".to_string(),
        ));
    }

    let looks_absolute = Path::new(raw).is_absolute()
        || raw.starts_with('\\')
        || raw.as_bytes().get(1) == Some(&b':');
    if looks_absolute {
        return Err(WorkflowError::RestrictedPath(
            "absolute file paths are not allowed".to_string(),
        ));
    }

    if raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(WorkflowError::RestrictedPath(
            "file path cannot contain '..'".to_string(),
        ));
    }

    let normalized = raw
        .strip_prefix("./")
        .or_else(|| raw.strip_prefix(".\\"))
        .unwrap_or(raw);
    let in_workflows_dir =
        normalized.starts_with("workflows/") || normalized.starts_with("workflows\\");
    let bare_filename = !normalized.contains('/') && !normalized.contains('\\');

    if in_workflows_dir || bare_filename {
        Ok(Path::new(raw))
    } else {
        Err(WorkflowError::RestrictedPath(
            "workflows must be loaded from the workflows/ directory".to_string(),
        ))
    }
}

/// Parse a YAML document into a validated `Workflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Load and validate a workflow document from a restricted location.
pub fn load_workflow(path: &str) -> Result<Workflow, WorkflowError> {
    let path = restricted_path(path)?;
    let contents = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&contents)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
