//! Conflated blocks must have the same effect as the blocks they replace.

use heaplink::heap::{apply_block, DeltaBlock, DeltaOp};
use heaplink::{Conflater, ConflaterRegistry, ConflationStrategy, LinkError, Sequence, SimpleConflater, SmartConflater};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn sequential(initial: &Value, blocks: &[DeltaBlock]) -> Value {
    let mut state = initial.clone();
    for block in blocks {
        apply_block(&mut state, block);
    }
    state
}

fn chain(ops: Vec<Vec<DeltaOp>>) -> Vec<DeltaBlock> {
    let mut from = Sequence(0);
    ops.into_iter()
        .map(|ops| {
            let block = DeltaBlock::next(from, ops);
            from = block.to;
            block
        })
        .collect()
}

#[test]
fn test_two_sets_conflate_to_last() {
    let initial = json!({"x": 0});
    let blocks = chain(vec![
        vec![DeltaOp::set(["x"], json!(1))],
        vec![DeltaOp::set(["x"], json!(2))],
    ]);

    for conflater in [&SimpleConflater as &dyn Conflater, &SmartConflater] {
        let merged = conflater.conflate(&blocks).unwrap();
        assert_eq!(merged.from, Sequence(0));
        assert_eq!(merged.to, Sequence(2));
        assert_eq!(merged.ops, vec![DeltaOp::set(["x"], json!(2))]);

        let mut state = initial.clone();
        apply_block(&mut state, &merged);
        assert_eq!(state, json!({"x": 2}));
        assert_eq!(state, sequential(&initial, &blocks));
    }
}

#[test]
fn test_gap_is_refused() {
    let blocks = vec![
        DeltaBlock::next(Sequence(0), vec![DeltaOp::set(["x"], json!(1))]),
        DeltaBlock::next(Sequence(2), vec![DeltaOp::set(["x"], json!(3))]),
    ];
    assert!(matches!(
        SimpleConflater.conflate(&blocks),
        Err(LinkError::NonContiguousDeltas { .. })
    ));
}

#[test]
fn test_registry_strategies() {
    let registry = ConflaterRegistry::new();
    registry.register("keep-all", Arc::new(SimpleConflater));

    assert_eq!(registry.resolve(&ConflationStrategy::Simple).unwrap().name(), "simple");
    assert_eq!(registry.resolve(&ConflationStrategy::Smart).unwrap().name(), "smart");
    assert_eq!(
        registry
            .resolve(&ConflationStrategy::Custom("keep-all".into()))
            .unwrap()
            .name(),
        "simple"
    );

    let disabled = registry.resolve(&ConflationStrategy::None).unwrap();
    let blocks = chain(vec![vec![DeltaOp::set(["x"], json!(1))]]);
    assert!(matches!(
        disabled.conflate(&blocks),
        Err(LinkError::ConflationDisabled)
    ));
}

fn segment() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "l", "0"]).prop_map(String::from)
}

fn path() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(segment(), 1..=3)
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0i64..5).prop_map(|n| json!(n)),
        Just(json!([])),
        Just(json!([1, 2])),
        Just(json!({"a": 1})),
    ]
}

fn op() -> impl Strategy<Value = DeltaOp> {
    prop_oneof![
        (path(), value()).prop_map(|(path, value)| DeltaOp::Set { path, value }),
        path().prop_map(|path| DeltaOp::Remove { path }),
        (path(), 0usize..3, value())
            .prop_map(|(path, index, value)| DeltaOp::Insert { path, index, value }),
        (path(), 0usize..3).prop_map(|(path, index)| DeltaOp::Delete { path, index }),
    ]
}

fn blocks() -> impl Strategy<Value = Vec<DeltaBlock>> {
    prop::collection::vec(prop::collection::vec(op(), 0..6), 1..6).prop_map(chain)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_simple_matches_sequential(blocks in blocks()) {
        let initial = json!({"a": 1, "l": [0, 1, 2]});
        let merged = SimpleConflater.conflate(&blocks).unwrap();
        prop_assert_eq!(merged.from, blocks[0].from);
        prop_assert_eq!(merged.to, blocks[blocks.len() - 1].to);

        let mut state = initial.clone();
        apply_block(&mut state, &merged);
        prop_assert_eq!(state, sequential(&initial, &blocks));
    }

    #[test]
    fn prop_smart_matches_sequential(blocks in blocks()) {
        let initial = json!({"a": {"l": []}, "l": [0, 1, 2]});
        let merged = SmartConflater.conflate(&blocks).unwrap();
        let total: usize = blocks.iter().map(DeltaBlock::len).sum();
        prop_assert!(merged.len() <= total);

        let mut state = initial.clone();
        apply_block(&mut state, &merged);
        prop_assert_eq!(state, sequential(&initial, &blocks));
    }
}
