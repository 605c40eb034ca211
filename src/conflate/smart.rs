//! Cancellation-aware conflation.

use super::simple::collapse_overwrites;
use super::{concat, Conflater};
use crate::error::Result;
use crate::heap::delta::related;
use crate::heap::{DeltaBlock, DeltaOp};

/// [`SimpleConflater`](super::SimpleConflater) plus elimination of provably
/// cancelled pairs.
///
/// An `Insert` into list L at index i followed by a `Delete` from L at index i
/// cancels when no op in between targets a path related to L: either the
/// insert succeeded and the delete removes exactly that element, or both were
/// out of range and neither did anything. Cancellation runs to a fixpoint,
/// then overwrites are collapsed.
pub struct SmartConflater;

impl Conflater for SmartConflater {
    fn name(&self) -> &str {
        "smart"
    }

    fn conflate(&self, blocks: &[DeltaBlock]) -> Result<DeltaBlock> {
        let mut merged = concat(blocks)?;
        let mut ops = merged.ops;
        while let Some((insert, delete)) = find_cancelled_pair(&ops) {
            ops.remove(delete);
            ops.remove(insert);
        }
        merged.ops = collapse_overwrites(ops);
        Ok(merged)
    }
}

fn find_cancelled_pair(ops: &[DeltaOp]) -> Option<(usize, usize)> {
    for (at, op) in ops.iter().enumerate() {
        let DeltaOp::Insert { path, index, .. } = op else {
            continue;
        };

        for (offset, later) in ops[at + 1..].iter().enumerate() {
            if let DeltaOp::Delete {
                path: other,
                index: other_index,
            } = later
            {
                if other == path && other_index == index {
                    return Some((at, at + 1 + offset));
                }
            }
            if related(later.target(), path) {
                break;
            }
        }
    }
    None
}
