//! Three-way rebase of one change set over another.
//!
//! `transform_object_diff(local, upstream, base)` returns a change set that,
//! applied after `upstream` has been applied to `base`, preserves the intent
//! of `local`. Conflicts the algebra cannot merge drop the local operation
//! (the server's value wins); callers recover by diffing afresh against the
//! updated document.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::dmp;
use crate::operation::{Operation, OperationSet};

/// Rebase `local` over `upstream`, both diffs of the same `base` document.
pub fn transform_object_diff(
    local: &OperationSet,
    upstream: &OperationSet,
    base: &Value,
) -> OperationSet {
    let empty = serde_json::Map::new();
    let base_map = base.as_object().unwrap_or(&empty);
    let mut out = OperationSet::new();
    for (key, lop) in local {
        match upstream.get(key) {
            None => {
                out.insert(key.clone(), lop.clone());
            }
            Some(uop) => {
                if let Some(t) = transform_op(lop, uop, base_map.get(key)) {
                    out.insert(key.clone(), t);
                }
            }
        }
    }
    out
}

/// Rebase one operation over a concurrent one at the same path. `None` drops
/// the local operation.
fn transform_op(local: &Operation, upstream: &Operation, base: Option<&Value>) -> Option<Operation> {
    use Operation::*;
    match (local, upstream) {
        // Both sides created the key: keep the local value, but as a replace
        // so it overwrites the upstream creation.
        (Add(lv), Add(_)) => Some(Replace(lv.clone())),
        (Add(lv), Remove) => Some(Add(lv.clone())),
        (Add(_), _) => None,

        (Remove, Remove) => None,
        (Remove, _) => Some(Remove),

        (Replace(_), Add(_)) => None,
        (Replace(_), Replace(_)) => None,
        (Replace(lv), _) => Some(Replace(lv.clone())),

        (Increment(n), Increment(_)) => Some(Increment(n.clone())),
        (Increment(_), _) => None,

        (Object(lc), Object(uc)) => {
            let sub = base?;
            let t = transform_object_diff(lc, uc, sub);
            if t.is_empty() {
                None
            } else {
                Some(Object(t))
            }
        }
        (List(lc), List(uc)) => transform_list_diff(lc, uc, base?.as_array()?),
        (Object(_), _) | (List(_), _) => None,

        (Dmp(lp), Dmp(up)) => {
            let base_str = base?.as_str()?;
            match dmp::transform(lp, up, base_str) {
                Some(p) if !p.is_empty() => Some(Dmp(p)),
                _ => None,
            }
        }
        (Dmp(_), _) => None,
    }
}

/// Rebase list operations: upstream insertions and removals shift the local
/// keys; edits of the same element recurse; a local edit of an element the
/// upstream removed is dropped.
fn transform_list_diff(
    local: &BTreeMap<usize, Operation>,
    upstream: &BTreeMap<usize, Operation>,
    base: &[Value],
) -> Option<Operation> {
    let mut out = BTreeMap::new();
    for (&idx, lop) in local {
        let adds_at_or_below = upstream
            .iter()
            .filter(|(&k, op)| matches!(op, Operation::Add(_)) && k <= idx)
            .count();
        let removes_below = upstream
            .iter()
            .filter(|(&k, op)| matches!(op, Operation::Remove) && k < idx)
            .count();
        let shifted = idx + adds_at_or_below - removes_below;
        match upstream.get(&idx) {
            Some(Operation::Remove) => continue,
            Some(uop) if !matches!(uop, Operation::Add(_)) => {
                if let Some(t) = transform_op(lop, uop, base.get(idx)) {
                    out.insert(shifted, t);
                }
            }
            _ => {
                out.insert(shifted, lop.clone());
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Operation::List(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_object_diff;
    use crate::diff::object_diff;
    use serde_json::json;

    fn diff(a: &Value, b: &Value) -> OperationSet {
        object_diff(a.as_object().unwrap(), b.as_object().unwrap())
    }

    /// Both orders must converge when nothing is dropped.
    fn converges(base: Value, local_doc: Value, upstream_doc: Value, want: Value) {
        let local = diff(&base, &local_doc);
        let upstream = diff(&base, &upstream_doc);
        let after_upstream = apply_object_diff(&upstream, &base).unwrap();
        let rebased = transform_object_diff(&local, &upstream, &base);
        let got = apply_object_diff(&rebased, &after_upstream).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn disjoint_keys_commute() {
        converges(
            json!({"a": 1, "b": 1}),
            json!({"a": 2, "b": 1}),
            json!({"a": 1, "b": 2}),
            json!({"a": 2, "b": 2}),
        );
    }

    #[test]
    fn increments_commute() {
        converges(
            json!({"c": 5}),
            json!({"c": 7}),
            json!({"c": 8}),
            json!({"c": 10}),
        );
    }

    #[test]
    fn text_edits_merge() {
        converges(
            json!({"t": "hello"}),
            json!({"t": "hello world"}),
            json!({"t": "hello!"}),
            json!({"t": "hello world!"}),
        );
    }

    #[test]
    fn nested_objects_recurse() {
        converges(
            json!({"u": {"a": 1, "b": 1}}),
            json!({"u": {"a": 2, "b": 1}}),
            json!({"u": {"a": 1, "b": 2}}),
            json!({"u": {"a": 2, "b": 2}}),
        );
    }

    #[test]
    fn replace_conflict_drops_local() {
        // Kind changes on both sides produce replace vs replace.
        let base = json!({"k": "a"});
        let local = diff(&base, &json!({"k": 1}));
        let upstream = diff(&base, &json!({"k": 2}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert!(rebased.is_empty());
    }

    #[test]
    fn unmergeable_text_edits_drop_local() {
        // Local rewrites the whole string; after the upstream rewrite its
        // context no longer exists, so the rebase drops it.
        let base = json!({"k": "alpha"});
        let local = diff(&base, &json!({"k": "omega"}));
        let upstream = diff(&base, &json!({"k": "sigma"}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert!(rebased.is_empty());
    }

    #[test]
    fn remove_survives_upstream_edit() {
        let base = json!({"k": 1});
        let local = diff(&base, &json!({}));
        let upstream = diff(&base, &json!({"k": 2}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert_eq!(rebased.get("k"), Some(&Operation::Remove));
    }

    #[test]
    fn double_remove_drops_local() {
        let base = json!({"k": 1});
        let local = diff(&base, &json!({}));
        let rebased = transform_object_diff(&local, &local.clone(), &base);
        assert!(rebased.is_empty());
    }

    #[test]
    fn concurrent_add_keeps_local_as_replace() {
        let base = json!({});
        let local = diff(&base, &json!({"k": "mine"}));
        let upstream = diff(&base, &json!({"k": "theirs"}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert_eq!(rebased.get("k"), Some(&Operation::Replace(json!("mine"))));
        let after_upstream = apply_object_diff(&upstream, &base).unwrap();
        let got = apply_object_diff(&rebased, &after_upstream).unwrap();
        assert_eq!(got, json!({"k": "mine"}));
    }

    #[test]
    fn increment_dropped_under_replace() {
        let base = json!({"c": 5});
        let local = diff(&base, &json!({"c": 6}));
        let mut upstream = OperationSet::new();
        upstream.insert("c".to_string(), Operation::Replace(json!("reset")));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert!(rebased.is_empty());
    }

    #[cfg(feature = "list-diff")]
    #[test]
    fn list_edits_on_distinct_elements_converge() {
        converges(
            json!({"l": [1, 2, 3]}),
            json!({"l": [9, 2, 3]}),
            json!({"l": [1, 2, 9]}),
            json!({"l": [9, 2, 9]}),
        );
    }

    #[cfg(feature = "list-diff")]
    #[test]
    fn upstream_remove_drops_local_list_edit() {
        let base = json!({"l": [1, 2]});
        let local = diff(&base, &json!({"l": [1, 9]}));
        let upstream = diff(&base, &json!({"l": [1]}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        assert!(rebased.is_empty());
    }

    #[cfg(feature = "list-diff")]
    #[test]
    fn upstream_append_shifts_nothing_below() {
        converges(
            json!({"l": [1, 2]}),
            json!({"l": [9, 2]}),
            json!({"l": [1, 2, 3]}),
            json!({"l": [9, 2, 3]}),
        );
    }

    #[cfg(feature = "list-diff")]
    #[test]
    fn upstream_insert_below_shifts_local_edit_key() {
        let base = json!({"l": [1, 2, 3]});
        // Local edits index 2; upstream prepends at index 0, so the edited
        // element now lives at index 3.
        let local = diff(&base, &json!({"l": [1, 2, 9]}));
        let upstream = diff(&base, &json!({"l": [0, 1, 2, 3]}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        match rebased.get("l") {
            Some(Operation::List(ops)) => {
                assert_eq!(ops.len(), 1);
                assert!(matches!(ops.get(&3), Some(Operation::Increment(_))));
            }
            other => panic!("expected list diff, got {other:?}"),
        }

        let after_upstream = apply_object_diff(&upstream, &base).unwrap();
        let got = apply_object_diff(&rebased, &after_upstream).unwrap();
        assert_eq!(got, json!({"l": [0, 1, 2, 9]}));
    }

    #[cfg(feature = "list-diff")]
    #[test]
    fn upstream_remove_below_shifts_local_edit_key() {
        let base = json!({"l": [1, 2, 3]});
        // Upstream drops index 0; the locally edited element moves down to
        // index 1.
        let local = diff(&base, &json!({"l": [1, 2, 9]}));
        let upstream = diff(&base, &json!({"l": [2, 3]}));
        let rebased = transform_object_diff(&local, &upstream, &base);
        match rebased.get("l") {
            Some(Operation::List(ops)) => {
                assert_eq!(ops.len(), 1);
                assert!(matches!(ops.get(&1), Some(Operation::Increment(_))));
            }
            other => panic!("expected list diff, got {other:?}"),
        }

        let after_upstream = apply_object_diff(&upstream, &base).unwrap();
        let got = apply_object_diff(&rebased, &after_upstream).unwrap();
        assert_eq!(got, json!({"l": [2, 9]}));
    }
}
