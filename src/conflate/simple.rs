//! Overwrite-collapsing conflation.

use super::{concat, Conflater};
use crate::error::Result;
use crate::heap::delta::{is_prefix, related};
use crate::heap::{DeltaBlock, DeltaOp};

/// Keeps op order and drops writes that a later `Set` fully overwrites.
///
/// A `Set` or `Remove` at path P is dropped when a later `Set` targets P or an
/// ancestor of P and no op in between targets a path related to P. A `Remove`
/// followed by another `Remove` of the same path is also dropped.
pub struct SimpleConflater;

impl Conflater for SimpleConflater {
    fn name(&self) -> &str {
        "simple"
    }

    fn conflate(&self, blocks: &[DeltaBlock]) -> Result<DeltaBlock> {
        let mut merged = concat(blocks)?;
        merged.ops = collapse_overwrites(merged.ops);
        Ok(merged)
    }
}

/// Whether `ops[at]` is made redundant by something later in `ops`.
fn overwritten_later(ops: &[DeltaOp], at: usize) -> bool {
    let path = match &ops[at] {
        DeltaOp::Set { path, .. } | DeltaOp::Remove { path } => path,
        _ => return false,
    };
    let is_remove = matches!(ops[at], DeltaOp::Remove { .. });

    for later in &ops[at + 1..] {
        match later {
            DeltaOp::Set { path: other, .. } if is_prefix(other, path) => return true,
            DeltaOp::Remove { path: other } if is_remove && other == path => return true,
            _ => {}
        }
        if related(later.target(), path) {
            return false;
        }
    }
    false
}

pub(crate) fn collapse_overwrites(ops: Vec<DeltaOp>) -> Vec<DeltaOp> {
    let keep: Vec<bool> = (0..ops.len()).map(|i| !overwritten_later(&ops, i)).collect();
    ops.into_iter()
        .zip(keep)
        .filter_map(|(op, keep)| keep.then_some(op))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::apply_block;
    use crate::types::Sequence;
    use serde_json::json;

    #[test]
    fn test_last_write_wins() {
        // {x:0} at seq 0; B1 sets x=1, B2 sets x=2.
        let b1 = DeltaBlock::next(Sequence(0), vec![DeltaOp::set(["x"], json!(1))]);
        let b2 = DeltaBlock::next(Sequence(1), vec![DeltaOp::set(["x"], json!(2))]);

        let merged = SimpleConflater.conflate(&[b1.clone(), b2.clone()]).unwrap();
        assert_eq!(merged.ops, vec![DeltaOp::set(["x"], json!(2))]);
        assert_eq!((merged.from, merged.to), (Sequence(0), Sequence(2)));

        let mut sequential = json!({"x": 0});
        apply_block(&mut sequential, &b1);
        apply_block(&mut sequential, &b2);

        let mut conflated = json!({"x": 0});
        apply_block(&mut conflated, &merged);

        assert_eq!(conflated, json!({"x": 2}));
        assert_eq!(conflated, sequential);
    }

    #[test]
    fn test_parent_overwrite_drops_child_writes() {
        let ops = vec![
            DeltaOp::set(["a", "b"], json!(1)),
            DeltaOp::remove(["a", "c"]),
            DeltaOp::set(["a"], json!({"fresh": true})),
        ];
        let collapsed = collapse_overwrites(ops);
        assert_eq!(collapsed, vec![DeltaOp::set(["a"], json!({"fresh": true}))]);
    }

    #[test]
    fn test_intervening_related_op_blocks_collapse() {
        let ops = vec![
            DeltaOp::set(["list"], json!([])),
            DeltaOp::insert(["list"], 0, json!(1)),
            DeltaOp::set(["list"], json!([9])),
        ];
        // The insert observes the first Set, so nothing collapses.
        let collapsed = collapse_overwrites(ops);
        assert_eq!(
            collapsed,
            vec![
                DeltaOp::set(["list"], json!([])),
                DeltaOp::insert(["list"], 0, json!(1)),
                DeltaOp::set(["list"], json!([9])),
            ]
        );
    }

    #[test]
    fn test_set_then_remove_is_kept() {
        let ops = vec![DeltaOp::set(["a", "b"], json!(1)), DeltaOp::remove(["a", "b"])];
        let collapsed = collapse_overwrites(ops.clone());
        assert_eq!(collapsed, ops);
    }

    #[test]
    fn test_unrelated_ops_survive() {
        let ops = vec![
            DeltaOp::set(["x"], json!(1)),
            DeltaOp::set(["y"], json!(1)),
            DeltaOp::set(["x"], json!(2)),
        ];
        let collapsed = collapse_overwrites(ops);
        assert_eq!(
            collapsed,
            vec![DeltaOp::set(["y"], json!(1)), DeltaOp::set(["x"], json!(2))]
        );
    }
}
