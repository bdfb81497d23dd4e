//! Generic traversal over `serde_json::Value` trees.
//!
//! Tasks are serde-serializable, so a serialized value tree is the uniform
//! view of any task's fields. Everything that needs to look at "all fields
//! of an arbitrary task" — the structural diff, the dry-run report, the
//! flag builder — is a visitor over this walk.
//!
//! Visitors see `(path, value)` pairs and may return [`Visit::Skip`] to
//! stop descent into the current subtree. Scalars and nulls are leaves.

use serde_json::Value;

use crate::error::Result;

/// Visitor verdict for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Descend into the node's children (no-op for leaves).
    Continue,
    /// Do not descend into this subtree.
    Skip,
}

/// Depth-first walk of `value`, invoking `visit` with a dotted path for
/// every node. The root is visited with an empty path.
pub fn walk<F>(value: &Value, visit: &mut F) -> Result<()>
where
    F: FnMut(&str, &Value) -> Result<Visit>,
{
    walk_at("", value, visit)
}

fn walk_at<F>(path: &str, value: &Value, visit: &mut F) -> Result<()>
where
    F: FnMut(&str, &Value) -> Result<Visit>,
{
    if visit(path, value)? == Visit::Skip {
        return Ok(());
    }

    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                walk_at(&child, v, visit)?;
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let child = format!("{path}[{i}]");
                walk_at(&child, v, visit)?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Longest value rendered in full by [`as_string`]; longer strings are
/// truncated with a trailing ellipsis so resource bodies do not swamp the
/// dry-run report.
const MAX_RENDERED: usize = 64;

/// Human-readable rendering of a value for reports.
///
/// Nulls render as `<nil>`, lists as `[a, b]`, maps as `{k: v}`. Strings
/// are printed bare (truncated past [`MAX_RENDERED`] characters).
pub fn as_string(value: &Value) -> String {
    match value {
        Value::Null => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => limited_prefix(s, MAX_RENDERED),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(as_string).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, as_string(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

/// At most the first `n` characters of `s`, with an ellipsis when cut.
pub fn limited_prefix(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    let prefix: String = s.chars().take(n).collect();
    format!("{prefix}...")
}
