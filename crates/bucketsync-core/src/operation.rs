//! The operation algebra and its wire encoding.
//!
//! A diff between two JSON documents is a mapping from keys to operations.
//! Each operation is encoded on the wire as `{"o": <tag>, "v": <value>}`;
//! the `-` (remove) tag carries no `v`.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::error::DiffError;

/// Edits to one top-level JSON object, keyed by field name.
///
/// `BTreeMap` keeps key iteration in lexicographic order, so two peers
/// diffing the same documents produce byte-identical change sets.
pub type OperationSet = BTreeMap<String, Operation>;

/// A single edit applied at one key or list index.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert a value at a key/index that is not yet present.
    Add(Value),
    /// Delete the value at the path.
    Remove,
    /// Wholesale replace the value at the path.
    Replace(Value),
    /// Numeric delta; commutes with concurrent increments.
    Increment(Number),
    /// Recursive diff of a list, keyed by pre-image index.
    List(BTreeMap<usize, Operation>),
    /// Recursive diff of a nested mapping.
    Object(OperationSet),
    /// A diff-match-patch patch string for two non-empty strings.
    Dmp(String),
}

impl Operation {
    /// The single-character wire tag for this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::Add(_) => "+",
            Operation::Remove => "-",
            Operation::Replace(_) => "r",
            Operation::Increment(_) => "I",
            Operation::List(_) => "L",
            Operation::Object(_) => "O",
            Operation::Dmp(_) => "d",
        }
    }

    /// Encode as the wire JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("o".to_string(), Value::String(self.tag().to_string()));
        match self {
            Operation::Add(v) | Operation::Replace(v) => {
                obj.insert("v".to_string(), v.clone());
            }
            Operation::Remove => {}
            Operation::Increment(n) => {
                obj.insert("v".to_string(), Value::Number(n.clone()));
            }
            Operation::List(ops) => {
                let mut child = Map::new();
                for (idx, op) in ops {
                    child.insert(idx.to_string(), op.to_value());
                }
                obj.insert("v".to_string(), Value::Object(child));
            }
            Operation::Object(ops) => {
                obj.insert("v".to_string(), set_to_value(ops));
            }
            Operation::Dmp(patch) => {
                obj.insert("v".to_string(), Value::String(patch.clone()));
            }
        }
        Value::Object(obj)
    }

    /// Decode from the wire JSON object.
    pub fn from_value(value: &Value) -> Result<Operation, DiffError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DiffError::MalformedOperation("operation is not an object".into()))?;
        let tag = obj
            .get("o")
            .and_then(Value::as_str)
            .ok_or_else(|| DiffError::MalformedOperation("missing operation tag".into()))?;
        let v = obj.get("v");
        fn need<'a>(v: Option<&'a Value>, tag: &str) -> Result<&'a Value, DiffError> {
            v.ok_or_else(|| DiffError::MalformedOperation(format!("tag {tag:?} requires a value")))
        }
        match tag {
            "+" => Ok(Operation::Add(need(v, tag)?.clone())),
            "-" => Ok(Operation::Remove),
            "r" => Ok(Operation::Replace(need(v, tag)?.clone())),
            "I" => match need(v, tag)? {
                Value::Number(n) => Ok(Operation::Increment(n.clone())),
                other => Err(DiffError::MalformedOperation(format!(
                    "increment value is not a number: {other}"
                ))),
            },
            "L" => {
                let child = need(v, tag)?.as_object().ok_or_else(|| {
                    DiffError::MalformedOperation("list diff value is not an object".into())
                })?;
                let mut ops = BTreeMap::new();
                for (key, val) in child {
                    let idx: usize = key.parse().map_err(|_| {
                        DiffError::MalformedOperation(format!("bad list index {key:?}"))
                    })?;
                    ops.insert(idx, Operation::from_value(val)?);
                }
                Ok(Operation::List(ops))
            }
            "O" => Ok(Operation::Object(set_from_value(need(v, tag)?)?)),
            "d" => match need(v, tag)? {
                Value::String(s) => Ok(Operation::Dmp(s.clone())),
                other => Err(DiffError::MalformedOperation(format!(
                    "text patch value is not a string: {other}"
                ))),
            },
            other => Err(DiffError::MalformedOperation(format!(
                "unknown operation tag {other:?}"
            ))),
        }
    }
}

/// Encode an operation set as a JSON object.
pub fn set_to_value(ops: &OperationSet) -> Value {
    let mut obj = Map::new();
    for (key, op) in ops {
        obj.insert(key.clone(), op.to_value());
    }
    Value::Object(obj)
}

/// Decode an operation set from a JSON object.
pub fn set_from_value(value: &Value) -> Result<OperationSet, DiffError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DiffError::MalformedOperation("change set is not an object".into()))?;
    let mut ops = OperationSet::new();
    for (key, val) in obj {
        ops.insert(key.clone(), Operation::from_value(val)?);
    }
    Ok(ops)
}
