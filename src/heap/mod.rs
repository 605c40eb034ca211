//! Heaps: server-held object graphs replicated to subscribers as deltas.
//!
//! The publishing side keeps heaps in a [`HeapRegistry`]; the subscribing side
//! mirrors them in a [`ReplicaSet`]. Both apply the same [`DeltaBlock`]s with
//! [`apply_block`].

pub(crate) mod delta;
mod registry;
mod replica;
mod types;

pub use delta::{apply_block, apply_op, DeltaBlock, DeltaOp, Path};
pub use registry::HeapRegistry;
pub use replica::{Replica, ReplicaNotice, ReplicaSet};
pub use types::{HeapSnapshot, RegistryConfig, Subscription, TerminationNotice};
