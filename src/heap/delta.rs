//! Delta blocks and their application to heap state.
//!
//! Heap state is a JSON document. A [`DeltaBlock`] carries an ordered list of
//! [`DeltaOp`]s and the sequence range it advances. Application is total:
//! an operation whose target cannot be reached is a no-op rather than an
//! error, so the outcome of any op list depends only on the starting state.

use crate::error::{LinkError, Result};
use crate::types::Sequence;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path from the heap root. List elements are addressed by decimal index.
pub type Path = Vec<String>;

/// One change to a heap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Set the value at `path`, creating missing intermediate objects.
    Set { path: Path, value: Value },
    /// Remove an object key.
    Remove { path: Path },
    /// Insert into the list at `path`. Requires `index <= len`.
    Insert {
        path: Path,
        index: usize,
        value: Value,
    },
    /// Delete from the list at `path`. Requires `index < len`.
    Delete { path: Path, index: usize },
}

fn to_path<I, S>(segments: I) -> Path
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments.into_iter().map(Into::into).collect()
}

impl DeltaOp {
    pub fn set<I, S>(path: I, value: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeltaOp::Set {
            path: to_path(path),
            value,
        }
    }

    pub fn remove<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeltaOp::Remove {
            path: to_path(path),
        }
    }

    pub fn insert<I, S>(path: I, index: usize, value: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeltaOp::Insert {
            path: to_path(path),
            index,
            value,
        }
    }

    pub fn delete<I, S>(path: I, index: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeltaOp::Delete {
            path: to_path(path),
            index,
        }
    }

    /// The coordinate this op writes. For list ops this is the list itself.
    pub fn target(&self) -> &[String] {
        match self {
            DeltaOp::Set { path, .. }
            | DeltaOp::Remove { path }
            | DeltaOp::Insert { path, .. }
            | DeltaOp::Delete { path, .. } => path,
        }
    }
}

/// `a` is `b` or an ancestor of `b`.
pub(crate) fn is_prefix(a: &[String], b: &[String]) -> bool {
    a.len() <= b.len() && a == &b[..a.len()]
}

/// Two coordinates can observe each other's writes.
pub(crate) fn related(a: &[String], b: &[String]) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

/// An immutable incremental change advancing a heap from `from` to `to`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaBlock {
    pub from: Sequence,
    pub to: Sequence,
    pub ops: Vec<DeltaOp>,
}

impl DeltaBlock {
    pub fn new(from: Sequence, to: Sequence, ops: Vec<DeltaOp>) -> Self {
        Self { from, to, ops }
    }

    /// A block advancing exactly one step past `from`.
    pub fn next(from: Sequence, ops: Vec<DeltaOp>) -> Self {
        Self::new(from, from.next(), ops)
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Check that `blocks` chain end-to-start.
    pub fn check_contiguous(blocks: &[DeltaBlock]) -> Result<()> {
        for pair in blocks.windows(2) {
            if pair[0].to != pair[1].from {
                return Err(LinkError::NonContiguousDeltas {
                    previous: pair[0].to,
                    next: pair[1].from,
                });
            }
        }
        Ok(())
    }
}

fn list_index(segment: &str, len: usize) -> Option<usize> {
    segment.parse::<usize>().ok().filter(|i| *i < len)
}

/// Walk to `path`, turning missing or scalar steps into empty objects.
/// Stops (returns `None`) at a list whose index is absent or out of range.
fn walk_create<'a>(mut node: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    for segment in path {
        if !node.is_object() && !node.is_array() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index = list_index(segment, items.len())?;
                &mut items[index]
            }
            _ => return None,
        };
    }
    Some(node)
}

/// Walk to `path` without modifying anything.
fn walk<'a>(mut node: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    for segment in path {
        node = match node {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => {
                let index = list_index(segment, items.len())?;
                &mut items[index]
            }
            _ => return None,
        };
    }
    Some(node)
}

/// Apply one op in place.
pub fn apply_op(state: &mut Value, op: &DeltaOp) {
    match op {
        DeltaOp::Set { path, value } => {
            let Some((last, parent)) = path.split_last() else {
                *state = value.clone();
                return;
            };
            let Some(parent) = walk_create(state, parent) else {
                return;
            };
            if !parent.is_object() && !parent.is_array() {
                *parent = Value::Object(Map::new());
            }
            match parent {
                Value::Object(map) => {
                    map.insert(last.clone(), value.clone());
                }
                Value::Array(items) => {
                    if let Some(index) = list_index(last, items.len()) {
                        items[index] = value.clone();
                    }
                }
                _ => {}
            }
        }

        DeltaOp::Remove { path } => {
            let Some((last, parent)) = path.split_last() else {
                *state = Value::Null;
                return;
            };
            if let Some(Value::Object(map)) = walk(state, parent) {
                map.remove(last);
            }
        }

        DeltaOp::Insert { path, index, value } => {
            if let Some(Value::Array(items)) = walk(state, path) {
                if *index <= items.len() {
                    items.insert(*index, value.clone());
                }
            }
        }

        DeltaOp::Delete { path, index } => {
            if let Some(Value::Array(items)) = walk(state, path) {
                if *index < items.len() {
                    items.remove(*index);
                }
            }
        }
    }
}

/// Apply every op of a block in order.
pub fn apply_block(state: &mut Value, block: &DeltaBlock) {
    for op in &block.ops {
        apply_op(state, op);
    }
}
