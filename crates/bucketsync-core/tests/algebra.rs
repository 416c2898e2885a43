//! Whole-algebra invariants: round-trip, identity, transform convergence.

use bucketsync_core::{
    apply_object_diff, object_diff, set_from_value, set_to_value, transform_object_diff,
    OperationSet,
};
use serde_json::{json, Value};

fn diff(a: &Value, b: &Value) -> OperationSet {
    object_diff(a.as_object().unwrap(), b.as_object().unwrap())
}

fn fixtures() -> Vec<Value> {
    vec![
        json!({}),
        json!({"a": 1}),
        json!({"a": 2, "b": "text"}),
        json!({"a": 1, "nested": {"x": true, "y": null}}),
        json!({"list": [1, 2, 3], "t": "the quick brown fox"}),
        json!({"list": [3, 2, 1], "t": "the quick brown dog jumped"}),
        json!({"list": [{"id": 1, "done": false}, {"id": 2, "done": true}]}),
        json!({"n": 1.5, "m": -42, "deep": {"deeper": {"deepest": "end"}}}),
        json!({"t": "shared prefix then different middle and shared suffix"}),
        json!({"t": "shared prefix with another middle and shared suffix"}),
    ]
}

#[test]
fn roundtrip_over_fixture_pairs() {
    let docs = fixtures();
    for a in &docs {
        for b in &docs {
            let ops = diff(a, b);
            let got = apply_object_diff(&ops, a).unwrap();
            assert_eq!(&got, b, "diff {a} -> {b} produced {ops:?}");
        }
    }
}

#[test]
fn identity_diff_is_empty() {
    for doc in fixtures() {
        assert!(diff(&doc, &doc).is_empty(), "non-empty self diff for {doc}");
    }
}

#[test]
fn empty_diff_is_identity() {
    for doc in fixtures() {
        let got = apply_object_diff(&OperationSet::new(), &doc).unwrap();
        assert_eq!(got, doc);
    }
}

#[test]
fn wire_encoding_roundtrips() {
    let docs = fixtures();
    for a in &docs {
        for b in &docs {
            let ops = diff(a, b);
            let encoded = set_to_value(&ops);
            let decoded = set_from_value(&encoded).unwrap();
            assert_eq!(decoded, ops);
        }
    }
}

#[test]
fn wire_encoding_is_deterministic() {
    let a = json!({"z": 1, "a": 2, "m": {"q": 1, "b": 2}});
    let b = json!({"z": 2, "a": 3, "m": {"q": 9, "b": 0}});
    let one = serde_json::to_string(&set_to_value(&diff(&a, &b))).unwrap();
    let two = serde_json::to_string(&set_to_value(&diff(&a, &b))).unwrap();
    assert_eq!(one, two);
}

/// Drop-free transforms must converge: applying the rebased local change
/// after the upstream one matches applying both edits to the base document.
#[test]
fn transform_converges_without_drops() {
    struct Case {
        base: Value,
        local: Value,
        upstream: Value,
        merged: Value,
    }
    let cases = vec![
        Case {
            base: json!({"a": 1, "b": 1}),
            local: json!({"a": 5, "b": 1}),
            upstream: json!({"a": 1, "b": 5}),
            merged: json!({"a": 5, "b": 5}),
        },
        Case {
            base: json!({"c": 10}),
            local: json!({"c": 12}),
            upstream: json!({"c": 13}),
            merged: json!({"c": 15}),
        },
        Case {
            base: json!({"t": "hello"}),
            local: json!({"t": "hello world"}),
            upstream: json!({"t": "hello!"}),
            merged: json!({"t": "hello world!"}),
        },
        Case {
            base: json!({"u": {"x": "aa bb cc", "y": 0}}),
            local: json!({"u": {"x": "aa bb cc dd", "y": 0}}),
            upstream: json!({"u": {"x": "aa bb cc", "y": 7}}),
            merged: json!({"u": {"x": "aa bb cc dd", "y": 7}}),
        },
        Case {
            base: json!({"doc": {"title": "draft"}}),
            local: json!({"doc": {"title": "draft", "body": "content"}}),
            upstream: json!({"doc": {"title": "draft", "tags": ["new"]}}),
            merged: json!({"doc": {"title": "draft", "body": "content", "tags": ["new"]}}),
        },
    ];
    for case in cases {
        let local = diff(&case.base, &case.local);
        let upstream = diff(&case.base, &case.upstream);
        let after_upstream = apply_object_diff(&upstream, &case.base).unwrap();
        let rebased = transform_object_diff(&local, &upstream, &case.base);
        let got = apply_object_diff(&rebased, &after_upstream).unwrap();
        assert_eq!(
            got, case.merged,
            "base {} local {} upstream {}",
            case.base, case.local, case.upstream
        );
    }
}

/// Increments commute in either rebase direction.
#[test]
fn increment_commutes_symmetrically() {
    let base = json!({"c": 5});
    let local = diff(&base, &json!({"c": 7}));
    let upstream = diff(&base, &json!({"c": 8}));

    let after_upstream = apply_object_diff(&upstream, &base).unwrap();
    let one = apply_object_diff(
        &transform_object_diff(&local, &upstream, &base),
        &after_upstream,
    )
    .unwrap();

    let after_local = apply_object_diff(&local, &base).unwrap();
    let two = apply_object_diff(
        &transform_object_diff(&upstream, &local, &base),
        &after_local,
    )
    .unwrap();

    assert_eq!(one, json!({"c": 10}));
    assert_eq!(two, json!({"c": 10}));
}

/// When the server replaces wholesale, local structured edits yield.
#[test]
fn upstream_replace_wins() {
    let base = json!({"k": {"a": 1}});
    let local = diff(&base, &json!({"k": {"a": 2}}));
    let upstream = diff(&base, &json!({"k": "flattened"}));
    let rebased = transform_object_diff(&local, &upstream, &base);
    assert!(rebased.is_empty());

    let after_upstream = apply_object_diff(&upstream, &base).unwrap();
    assert_eq!(after_upstream, json!({"k": "flattened"}));
}
