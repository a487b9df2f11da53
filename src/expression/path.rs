/// Lightweight path resolution and `{{ }}` interpolation
///
/// Used for templated node configuration (URLs, request bodies, sub-workflow
/// input) where the full expression engine is unnecessary. Lookups fail with a
/// typed error instead of panicking, and interpolation leaves any placeholder
/// it cannot resolve untouched.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PathError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("path '{path}' not found: missing key '{key}'")]
    NotFound { path: String, key: String },

    #[error("path '{path}': index {index} out of bounds (length {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },

    #[error("path '{path}': cannot index into {found} at '{segment}'")]
    NotIndexable {
        path: String,
        segment: String,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_steps(path: &str) -> Result<Vec<Step>, PathError> {
    let invalid = |reason: &str| PathError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }

    let mut steps = Vec::new();
    for part in path.trim().split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };
        if name.is_empty() && (rest.is_empty() || steps.is_empty()) {
            return Err(invalid("empty segment"));
        }
        if !name.is_empty() {
            steps.push(Step::Key(name.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let index = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid("array index must be a non-negative integer"))?;
            steps.push(Step::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid("unexpected characters after ']'"));
            }
        }
    }
    Ok(steps)
}

/// Walk `data` along a dotted path with optional `[n]` indices.
pub fn get_value_by_path<'a>(data: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let steps = parse_steps(path)?;
    let mut current = data;

    for step in steps {
        current = match step {
            Step::Key(key) => match current {
                Value::Object(map) => map.get(&key).ok_or_else(|| PathError::NotFound {
                    path: path.to_string(),
                    key: key.clone(),
                })?,
                other => {
                    return Err(PathError::NotIndexable {
                        path: path.to_string(),
                        segment: key,
                        found: json_kind(other),
                    })
                }
            },
            Step::Index(index) => match current {
                Value::Array(items) => items.get(index).ok_or(PathError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                })?,
                other => {
                    return Err(PathError::NotIndexable {
                        path: path.to_string(),
                        segment: format!("[{}]", index),
                        found: json_kind(other),
                    })
                }
            },
        };
    }

    Ok(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{ path }}` in `template` with the value found in `data`.
///
/// Placeholders that fail to resolve are kept verbatim so one bad reference
/// does not abort the whole template.
pub fn interpolate(template: &str, data: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };
        let placeholder = &rest[start..start + 2 + end + 2];
        match get_value_by_path(data, after_open[..end].trim()) {
            Ok(value) => output.push_str(&render(value)),
            Err(e) => {
                tracing::debug!("🔍 Leaving placeholder {} unresolved: {}", placeholder, e);
                output.push_str(placeholder);
            }
        }
        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    output
}

/// If `text` is exactly one placeholder, return its inner path.
fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Resolve templates throughout a JSON configuration value.
///
/// A string consisting of a single placeholder is replaced by the typed value
/// it points to (objects stay objects); other strings are interpolated.
pub fn resolve_templates(value: &Value, data: &Value) -> Value {
    match value {
        Value::String(text) => {
            if let Some(path) = sole_placeholder(text) {
                if let Ok(found) = get_value_by_path(data, path) {
                    return found.clone();
                }
                return value.clone();
            }
            if text.contains("{{") {
                Value::String(interpolate(text, data))
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_templates(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_templates(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}
