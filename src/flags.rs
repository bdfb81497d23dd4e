//! Command-line flag construction for node-side services.
//!
//! Renders a flat map of options into the sorted `--name=value` string a
//! service command line expects. Exposed to model templates as the `flags`
//! filter so a template can turn an options block into a kubelet or
//! apiserver invocation.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::walk::{walk, Visit};

/// Build a sorted flag string from an options value.
///
/// Only scalar leaves are representable; null fields are skipped, empty
/// strings render nothing. Nested objects flatten on their leaf names.
pub fn build_flags_value(options: &Value) -> Result<String> {
    let mut flags = build_flags_slice(options)?;
    flags.sort();
    Ok(flags.join(" "))
}

/// Typed convenience wrapper over [`build_flags_value`].
pub fn build_flags<T: Serialize>(options: &T) -> Result<String> {
    let value = serde_json::to_value(options)
        .map_err(|e| Error::other(format!("error serializing options: {e}")))?;
    build_flags_value(&value)
}

fn build_flags_slice(options: &Value) -> Result<Vec<String>> {
    if !options.is_object() {
        return Err(Error::other("flag options must be a map"));
    }

    let mut flags = Vec::new();
    walk(options, &mut |path, value| {
        let name = match path.rsplit('.').next() {
            Some(n) if !n.is_empty() => n,
            _ => return Ok(Visit::Continue),
        };
        match value {
            Value::Null | Value::Object(_) => Ok(Visit::Continue),
            Value::String(s) => {
                if !s.is_empty() {
                    flags.push(format!("--{name}={s}"));
                }
                Ok(Visit::Continue)
            }
            Value::Bool(b) => {
                flags.push(format!("--{name}={b}"));
                Ok(Visit::Continue)
            }
            Value::Number(n) => {
                flags.push(format!("--{name}={n}"));
                Ok(Visit::Continue)
            }
            Value::Array(_) => Err(Error::other(format!(
                "flag {name:?} has unsupported list value"
            ))),
        }
    })?;

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_are_sorted_and_formatted() {
        let options = json!({"v": 2, "cluster-name": "k8s"});
        assert_eq!(
            build_flags_value(&options).unwrap(),
            "--cluster-name=k8s --v=2"
        );
    }

    #[test]
    fn null_and_empty_fields_are_skipped() {
        let options = json!({"v": 2, "log-dir": null, "extra": ""});
        assert_eq!(build_flags_value(&options).unwrap(), "--v=2");
    }

    #[test]
    fn bool_flags_render_value() {
        let options = json!({"allow-privileged": true});
        assert_eq!(
            build_flags_value(&options).unwrap(),
            "--allow-privileged=true"
        );
    }

    #[test]
    fn list_values_are_rejected() {
        let options = json!({"etcd-servers": ["a", "b"]});
        assert!(build_flags_value(&options).is_err());
    }

    #[test]
    fn non_map_input_is_rejected() {
        assert!(build_flags_value(&json!("oops")).is_err());
    }
}
