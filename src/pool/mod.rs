//! Connection pool: at most one live session per endpoint, with automatic
//! reconnection.
//!
//! Each endpoint without a live session has exactly one [`ReconnectTask`].
//! Tasks run on a small shared worker pool and are paced by
//! [`backoff_delay`] between attempts.

mod config;
mod manager;
mod resolver;
mod scheduler;
mod types;

pub use config::PoolConfig;
pub use manager::SessionPool;
pub use resolver::{DnsResolver, EndpointResolver, StaticResolver};
pub use scheduler::{backoff_delay, ReconnectTask};
pub use types::{PendingStatus, PoolSnapshot, SessionStatus};
