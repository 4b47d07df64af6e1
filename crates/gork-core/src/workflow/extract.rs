//! Output extraction from step log streams.
//!
//! After a successful attempt the engine pulls values out of the collected
//! logs in two phases: structured HTTP lines become convenience outputs
//! (`status`, `body`, `header_*`), then each user-declared output is resolved
//! through its extraction rule (`json_path:`, `regex:`, `body`, `status`,
//! `full_output`, or a literal-contains fallback). Resolution is pure:
//! identical logs always yield identical values.

use serde_json::Value;

const STATUS_PREFIX: &str = "HTTP_STATUS:";
const BODY_PREFIX: &str = "HTTP_BODY:";
const HEADER_PREFIX: &str = "HTTP_HEADER_";

/// Phase 1: derive `status` / `body` / `header_<name>` outputs from the
/// runner's structured HTTP log lines.
pub fn http_convenience_outputs(logs: &[String]) -> Vec<(String, String)> {
    let mut outputs = Vec::new();
    for line in logs {
        if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
            outputs.push(("status".to_string(), rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(BODY_PREFIX) {
            outputs.push(("body".to_string(), rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
            if let Some(idx) = rest.find(':') {
                let name = rest[..idx].to_lowercase();
                let value = &rest[idx + 1..];
                outputs.push((format!("header_{name}"), value.to_string()));
            }
        }
    }
    outputs
}

/// Phase 2: resolve one user-declared extraction rule against the logs.
///
/// Returns `None` when the rule does not produce a non-empty value; the
/// engine only stores non-empty outputs.
pub fn resolve_output(rule: &str, logs: &[String]) -> Option<String> {
    let value = if let Some(path) = rule.strip_prefix("json_path:") {
        logs.iter()
            .find_map(|line| line.strip_prefix(BODY_PREFIX))
            .and_then(|body| extract_json_path(body, path))
    } else if let Some(pattern) = rule.strip_prefix("regex:") {
        let re = regex::Regex::new(pattern).ok()?;
        let joined = logs.join("\n");
        re.captures(&joined).map(|caps| {
            match caps.get(1) {
                Some(group) => group.as_str().to_string(),
                None => caps[0].to_string(),
            }
        })
    } else if rule == "body" {
        logs.iter()
            .find_map(|line| line.strip_prefix(BODY_PREFIX))
            .map(str::to_string)
    } else if rule == "status" {
        logs.iter()
            .find_map(|line| line.strip_prefix(STATUS_PREFIX))
            .map(str::to_string)
    } else if rule == "full_output" {
        Some(logs.join("\n"))
    } else {
        resolve_literal(rule, logs)
    };

    value.filter(|v| !v.is_empty())
}

/// Literal-contains fallback: the trimmed text after the first occurrence
/// with a non-empty tail wins; when every occurrence has an empty tail, the
/// first matching line itself is the value.
fn resolve_literal(literal: &str, logs: &[String]) -> Option<String> {
    let mut first_match: Option<&String> = None;
    for line in logs {
        if let Some(idx) = line.find(literal) {
            first_match.get_or_insert(line);
            let tail = line[idx + literal.len()..].trim();
            if !tail.is_empty() {
                return Some(tail.to_string());
            }
        }
    }
    first_match.map(|line| line.trim().to_string())
}

// ---------------------------------------------------------------------------
// JSON path
// ---------------------------------------------------------------------------

/// Evaluate a `$.`-rooted path against a JSON document.
///
/// Segments are separated by `.`; `[i]` indexes arrays, `[*]` expands one;
/// applying a field name to an array maps it across elements and collects
/// the values that exist. Strings render verbatim, everything else as
/// compact JSON.
fn extract_json_path(json: &str, path: &str) -> Option<String> {
    let path = path.strip_prefix("$.")?;
    let data: Value = serde_json::from_str(json).ok()?;

    let mut current = data;
    for part in split_path(path) {
        if part.is_empty() {
            continue;
        }
        current = apply_segment(current, &part)?;
        if current.is_null() {
            return None;
        }
    }

    match current {
        Value::String(s) => Some(s),
        other => serde_json::to_string(&other).ok(),
    }
}

fn apply_segment(current: Value, part: &str) -> Option<Value> {
    if let Some(bracket) = part.find('[') {
        let field = &part[..bracket];
        let index = part[bracket..].strip_prefix('[')?.strip_suffix(']')?;

        let target = if field.is_empty() {
            current
        } else {
            match current {
                Value::Object(mut map) => map.remove(field)?,
                _ => return None,
            }
        };

        let Value::Array(items) = target else {
            return None;
        };
        if index == "*" {
            Some(Value::Array(items))
        } else {
            let i: usize = index.parse().ok()?;
            items.into_iter().nth(i)
        }
    } else {
        match current {
            Value::Object(mut map) => map.remove(part),
            Value::Array(items) => {
                let collected: Vec<Value> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(mut map) => map.remove(part),
                        _ => None,
                    })
                    .collect();
                Some(Value::Array(collected))
            }
            _ => None,
        }
    }
}

/// Split a path on dots, keeping bracketed segments intact.
fn split_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;

    for ch in path.chars() {
        match ch {
            '.' if !in_bracket => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                in_bracket = true;
                current.push(ch);
            }
            ']' => {
                in_bracket = false;
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
