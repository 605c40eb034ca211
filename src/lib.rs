//! # Heaplink
//!
//! Pooled long-lived sessions to a set of endpoints, with push-based
//! replication of JSON "heaps" over those sessions.
//!
//! ## Core Concepts
//!
//! - **Pool**: At most one live session per endpoint, reconnecting with backoff
//! - **Session**: A handshaken connection that can be suspended or told to disconnect
//! - **Heap**: Published state whose changes are pushed as sequenced delta blocks
//! - **Conflation**: Merging a slow subscriber's backlog of deltas into fewer blocks
//!
//! ## Example
//!
//! ```ignore
//! use heaplink::{HeapRegistry, HeapServer, PoolConfig, RegistryConfig, ReplicaSet,
//!     ServerConfig, SessionPool, StaticResolver, TcpTransport};
//!
//! // Publishing side
//! let registry = Arc::new(HeapRegistry::new(RegistryConfig::default())?);
//! registry.create_heap("heap://prices", json!({"bid": 100}))?;
//! let server = HeapServer::bind(ServerConfig::default(), Arc::clone(&registry))?;
//!
//! // Subscribing side
//! let resolver = Arc::new(StaticResolver::new([server.endpoint()]));
//! let pool = SessionPool::new(PoolConfig::default(), Arc::new(TcpTransport::new()), resolver)?;
//! let replicas = Arc::new(ReplicaSet::new());
//! pool.add_listener(replicas.clone());
//! pool.start()?;
//!
//! let session = pool.get_session().expect("no session yet");
//! let id = replicas.subscribe(&session, "heap://prices", Duration::from_secs(5))?;
//! ```

pub mod conflate;
pub mod error;
pub mod heap;
pub mod pool;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use conflate::{Conflater, ConflaterRegistry, ConflationStrategy, SimpleConflater, SmartConflater};
pub use error::{LinkError, Result};
pub use heap::{
    DeltaBlock, DeltaOp, HeapRegistry, HeapSnapshot, RegistryConfig, Replica, ReplicaNotice,
    ReplicaSet, Subscription, TerminationNotice,
};
pub use pool::{
    backoff_delay, DnsResolver, EndpointResolver, PoolConfig, PoolSnapshot, SessionPool,
    StaticResolver,
};
pub use server::{HeapServer, ServerConfig};
pub use session::{Session, SessionListener, SessionRole, SessionState};
pub use transport::{Link, MemoryTransport, TcpTransport, Transport};
pub use types::*;
pub use wire::{CloseReason, Frame, PROTOCOL_VERSION};
