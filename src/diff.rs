//! Structural diff between an actual and an expected task.
//!
//! Both sides are serialized to value trees (unset fields are absent) and
//! compared top-level field by field. The result is a [`Changes`] map
//! holding the expected value for exactly the fields that differ:
//!
//! - when there is no actual, every set expected field is a change
//!   (the create path),
//! - an unset expected field is never flagged, whatever the actual says,
//! - set fields compare by deep value equality.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::walk::limited_prefix;

/// The changed subset of an expected task, keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    fields: BTreeMap<String, Value>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `field` differs between actual and expected.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// The expected value for a changed field.
    pub fn expected(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Changed field names, sorted.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}

/// Serialize a task to its value-tree form.
///
/// Tasks serialize to objects; anything else is a bug in the task type.
pub fn to_tree<T: Serialize>(task: &T) -> Result<Value> {
    let value = serde_json::to_value(task)
        .map_err(|e| Error::other(format!("error serializing task: {e}")))?;
    if !value.is_object() {
        return Err(Error::other("task did not serialize to an object"));
    }
    Ok(value)
}

/// Compute the changes needed to move `actual` to `expected`.
pub fn build_changes<T: Serialize>(actual: Option<&T>, expected: &T) -> Result<Changes> {
    let e_tree = to_tree(expected)?;
    let a_tree = match actual {
        Some(a) => Some(to_tree(a)?),
        None => None,
    };
    Ok(build_changes_from_trees(a_tree.as_ref(), &e_tree))
}

/// Tree-level variant used when the caller already holds serialized forms.
pub fn build_changes_from_trees(actual: Option<&Value>, expected: &Value) -> Changes {
    let mut changes = Changes::default();
    let empty = serde_json::Map::new();

    let e_map = expected.as_object().unwrap_or(&empty);
    let a_map = actual.and_then(|a| a.as_object()).unwrap_or(&empty);

    for (field, e_val) in e_map {
        if e_val.is_null() {
            continue;
        }
        let matches = match a_map.get(field) {
            Some(a_val) => a_val == e_val,
            None => false,
        };
        if !matches {
            changes.fields.insert(field.clone(), e_val.clone());
        }
    }

    changes
}

/// A user-friendly difference between two strings: the point where they
/// first diverge, with a bounded window of each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDiff {
    pub common_prefix: String,
    pub left: String,
    pub right: String,
}

/// Locate the first divergence between `l` and `r`.
pub fn first_diff(l: &str, r: &str) -> StringDiff {
    let lb = l.as_bytes();
    let rb = r.as_bytes();
    let min = lb.len().min(rb.len());

    let mut i = 0;
    while i < min && lb[i] == rb[i] {
        i += 1;
    }

    let window = 40;
    StringDiff {
        common_prefix: l[..i].to_string(),
        left: limited_prefix(&l[i..], window),
        right: limited_prefix(&r[i..], window),
    }
}
