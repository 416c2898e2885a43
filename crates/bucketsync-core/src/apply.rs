//! Apply an operation set to a document, producing a new document.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::dmp;
use crate::error::{DiffError, Result};
use crate::operation::{Operation, OperationSet};

/// Apply `ops` to `base` and return the resulting document. `base` is never
/// mutated; precondition failures leave it untouched and report which key
/// misbehaved.
pub fn apply_object_diff(ops: &OperationSet, base: &Value) -> Result<Value> {
    let map = base.as_object().ok_or_else(|| {
        DiffError::PreconditionViolated("document root is not an object".into())
    })?;
    let mut out = map.clone();
    for (key, op) in ops {
        apply_key(&mut out, key, op)?;
    }
    Ok(Value::Object(out))
}

fn apply_key(target: &mut Map<String, Value>, key: &str, op: &Operation) -> Result<()> {
    match op {
        Operation::Add(v) => {
            if target.contains_key(key) {
                return Err(DiffError::PreconditionViolated(format!(
                    "add over existing key {key:?}"
                )));
            }
            target.insert(key.to_string(), v.clone());
        }
        Operation::Remove => {
            target.remove(key).ok_or_else(|| {
                DiffError::PreconditionViolated(format!("remove of missing key {key:?}"))
            })?;
        }
        Operation::Replace(v) => {
            target.insert(key.to_string(), v.clone());
        }
        _ => {
            let current = target.get(key).ok_or_else(|| {
                DiffError::PreconditionViolated(format!("edit of missing key {key:?}"))
            })?;
            let next = apply_value(op, current)?;
            target.insert(key.to_string(), next);
        }
    }
    Ok(())
}

/// Apply a single operation to the value it targets.
fn apply_value(op: &Operation, current: &Value) -> Result<Value> {
    match op {
        Operation::Add(_) | Operation::Remove => Err(DiffError::PreconditionViolated(
            "add/remove require a containing collection".into(),
        )),
        Operation::Replace(v) => Ok(v.clone()),
        Operation::Increment(delta) => match current {
            Value::Number(n) => Ok(Value::Number(increment(n, delta)?)),
            other => Err(DiffError::PreconditionViolated(format!(
                "increment of non-number {other}"
            ))),
        },
        Operation::Object(child) => apply_object_diff(child, current),
        Operation::List(child) => match current {
            Value::Array(items) => Ok(Value::Array(apply_list_diff(child, items)?)),
            other => Err(DiffError::PreconditionViolated(format!(
                "list edit of non-list {other}"
            ))),
        },
        Operation::Dmp(patch) => match current {
            Value::String(s) => Ok(Value::String(dmp::apply_patch(patch, s)?)),
            other => Err(DiffError::PreconditionViolated(format!(
                "text patch of non-string {other}"
            ))),
        },
    }
}

fn increment(base: &Number, delta: &Number) -> Result<Number> {
    if let (Some(x), Some(d)) = (base.as_i64(), delta.as_i64()) {
        if let Some(sum) = x.checked_add(d) {
            return Ok(Number::from(sum));
        }
    }
    let x = base
        .as_f64()
        .ok_or_else(|| DiffError::PreconditionViolated("increment of non-finite base".into()))?;
    let d = delta
        .as_f64()
        .ok_or_else(|| DiffError::PreconditionViolated("non-finite increment delta".into()))?;
    Number::from_f64(x + d)
        .ok_or_else(|| DiffError::PreconditionViolated("increment overflowed".into()))
}

/// Apply list operations in ascending key order. Keys address the pre-image;
/// edits and removals are shifted by the net insertions/removals applied so
/// far, insertions land at their own key (consecutive insert runs are keyed
/// by their final positions).
pub(crate) fn apply_list_diff(
    ops: &BTreeMap<usize, Operation>,
    base: &[Value],
) -> Result<Vec<Value>> {
    let mut out = base.to_vec();
    let mut shift: isize = 0;
    for (&idx, op) in ops {
        match op {
            Operation::Add(v) => {
                let at = idx.min(out.len());
                out.insert(at, v.clone());
                shift += 1;
            }
            Operation::Remove => {
                let at = idx as isize + shift;
                if at < 0 || at as usize >= out.len() {
                    return Err(DiffError::PreconditionViolated(format!(
                        "remove of missing list index {idx}"
                    )));
                }
                out.remove(at as usize);
                shift -= 1;
            }
            other => {
                let at = idx as isize + shift;
                if at < 0 || at as usize >= out.len() {
                    return Err(DiffError::PreconditionViolated(format!(
                        "edit of missing list index {idx}"
                    )));
                }
                let at = at as usize;
                out[at] = apply_value(other, &out[at])?;
            }
        }
    }
    Ok(out)
}
