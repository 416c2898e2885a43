//! Structural diff: compute the operation set turning one document into
//! another.
//!
//! Keys present on exactly one side become `+`/`-`; keys on both sides
//! recurse by structural kind (mapping, list, string, number) and fall back
//! to a wholesale `r` on kind mismatch.

#[cfg(feature = "list-diff")]
use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::dmp;
use crate::operation::{Operation, OperationSet};

/// Diff two top-level objects.
pub fn object_diff(base: &Map<String, Value>, modified: &Map<String, Value>) -> OperationSet {
    let mut ops = OperationSet::new();
    for key in base.keys() {
        if !modified.contains_key(key) {
            ops.insert(key.clone(), Operation::Remove);
        }
    }
    for (key, new_val) in modified {
        match base.get(key) {
            None => {
                ops.insert(key.clone(), Operation::Add(new_val.clone()));
            }
            Some(old_val) => {
                if let Some(op) = value_diff(old_val, new_val) {
                    ops.insert(key.clone(), op);
                }
            }
        }
    }
    ops
}

/// Diff two values already known to live at the same path. `None` means the
/// values are equal.
pub fn value_diff(base: &Value, modified: &Value) -> Option<Operation> {
    if base == modified {
        return None;
    }
    let op = match (base, modified) {
        (Value::Object(a), Value::Object(b)) => Operation::Object(object_diff(a, b)),
        (Value::Array(a), Value::Array(b)) => list_diff(a, b),
        (Value::String(a), Value::String(b)) => string_diff(a, b),
        (Value::Number(a), Value::Number(b)) => number_diff(a, b),
        _ => Operation::Replace(modified.clone()),
    };
    Some(op)
}

fn string_diff(base: &str, modified: &str) -> Operation {
    if base.is_empty() || modified.is_empty() {
        return Operation::Replace(Value::String(modified.to_string()));
    }
    Operation::Dmp(dmp::make_patch(base, modified))
}

fn number_diff(base: &Number, modified: &Number) -> Operation {
    if let (Some(x), Some(y)) = (base.as_i64(), modified.as_i64()) {
        if let Some(delta) = y.checked_sub(x) {
            return Operation::Increment(Number::from(delta));
        }
    }
    let x = base.as_f64().unwrap_or(0.0);
    let y = modified.as_f64().unwrap_or(0.0);
    match Number::from_f64(y - x) {
        Some(delta) => Operation::Increment(delta),
        None => Operation::Replace(Value::Number(modified.clone())),
    }
}

/// Diff two lists. The common prefix and suffix are skipped; the middle is
/// diffed element-wise against the pre-image indexing, so paired edits come
/// first and the surplus of the longer side trails as `+`/`-` runs.
#[cfg(feature = "list-diff")]
fn list_diff(base: &[Value], modified: &[Value]) -> Operation {
    let prefix = base
        .iter()
        .zip(modified.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let a_rest = &base[prefix..];
    let b_rest = &modified[prefix..];
    let suffix = a_rest
        .iter()
        .rev()
        .zip(b_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let a_mid = &a_rest[..a_rest.len() - suffix];
    let b_mid = &b_rest[..b_rest.len() - suffix];

    let mut ops = BTreeMap::new();
    for i in 0..a_mid.len().max(b_mid.len()) {
        let key = prefix + i;
        match (a_mid.get(i), b_mid.get(i)) {
            (Some(a), Some(b)) => {
                if let Some(op) = value_diff(a, b) {
                    ops.insert(key, op);
                }
            }
            (Some(_), None) => {
                ops.insert(key, Operation::Remove);
            }
            (None, Some(b)) => {
                ops.insert(key, Operation::Add(b.clone()));
            }
            (None, None) => unreachable!("index below max of both lengths"),
        }
    }
    if ops.is_empty() {
        Operation::Replace(Value::Array(modified.to_vec()))
    } else {
        Operation::List(ops)
    }
}

#[cfg(not(feature = "list-diff"))]
fn list_diff(_base: &[Value], modified: &[Value]) -> Operation {
    Operation::Replace(Value::Array(modified.to_vec()))
}
