//! Delta conflation.
//!
//! A conflater merges an ordered, contiguous run of [`DeltaBlock`]s into one
//! block with the same effect. Applying the merged block to a replica last
//! synchronized at the run's starting sequence yields the same state as
//! applying every original block in turn.
//!
//! Strategies are selected with [`ConflationStrategy`]; operator-supplied
//! strategies are registered by name in a [`ConflaterRegistry`].

mod simple;
mod smart;

pub use simple::SimpleConflater;
pub use smart::SmartConflater;

use crate::error::{LinkError, Result};
use crate::heap::{DeltaBlock, DeltaOp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Merges pending delta blocks.
pub trait Conflater: Send + Sync {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Merge `blocks` (oldest first) into one equivalent block.
    fn conflate(&self, blocks: &[DeltaBlock]) -> Result<DeltaBlock>;
}

/// Which conflater a registry uses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflationStrategy {
    /// Never conflate; backlogs grow with the slowest consumer.
    #[default]
    None,
    Simple,
    Smart,
    /// A strategy registered under this name.
    Custom(String),
}

impl ConflationStrategy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ConflationStrategy::None)
    }
}

impl FromStr for ConflationStrategy {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(LinkError::UnknownConflater(s.to_string())),
            "none" => Ok(ConflationStrategy::None),
            "simple" => Ok(ConflationStrategy::Simple),
            "smart" => Ok(ConflationStrategy::Smart),
            other => Ok(ConflationStrategy::Custom(other.to_string())),
        }
    }
}

impl fmt::Display for ConflationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflationStrategy::None => f.write_str("none"),
            ConflationStrategy::Simple => f.write_str("simple"),
            ConflationStrategy::Smart => f.write_str("smart"),
            ConflationStrategy::Custom(name) => f.write_str(name),
        }
    }
}

/// Stand-in for a disabled strategy. Calling it is a programming error.
pub struct DisabledConflater;

impl Conflater for DisabledConflater {
    fn name(&self) -> &str {
        "none"
    }

    fn conflate(&self, _blocks: &[DeltaBlock]) -> Result<DeltaBlock> {
        Err(LinkError::ConflationDisabled)
    }
}

/// Static factory for the built-in strategies plus named custom ones.
pub struct ConflaterRegistry {
    custom: RwLock<HashMap<String, Arc<dyn Conflater>>>,
}

impl ConflaterRegistry {
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Register a caller-supplied strategy, replacing any previous one with
    /// the same name.
    pub fn register(&self, name: impl Into<String>, conflater: Arc<dyn Conflater>) {
        self.custom.write().insert(name.into(), conflater);
    }

    /// Build the conflater for `strategy`.
    pub fn resolve(&self, strategy: &ConflationStrategy) -> Result<Arc<dyn Conflater>> {
        match strategy {
            ConflationStrategy::None => Ok(Arc::new(DisabledConflater)),
            ConflationStrategy::Simple => Ok(Arc::new(SimpleConflater)),
            ConflationStrategy::Smart => Ok(Arc::new(SmartConflater)),
            ConflationStrategy::Custom(name) => self
                .custom
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| LinkError::UnknownConflater(name.clone())),
        }
    }
}

impl Default for ConflaterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate the ops of a contiguous run, returning the spanning range.
pub(crate) fn concat(blocks: &[DeltaBlock]) -> Result<DeltaBlock> {
    let (first, last) = match (blocks.first(), blocks.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(LinkError::EmptyConflation),
    };
    DeltaBlock::check_contiguous(blocks)?;

    let ops: Vec<DeltaOp> = blocks.iter().flat_map(|b| b.ops.iter().cloned()).collect();
    Ok(DeltaBlock::new(first.from, last.to, ops))
}
