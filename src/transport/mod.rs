//! Transports carry frames between the two ends of a session.
//!
//! A transport produces a [`Connected`] pair: a [`Link`] for outbound frames
//! and a channel of inbound frames. The inbound channel disconnects once the
//! remote closes, the link fails, or [`Link::close`] is called.

pub mod memory;
pub mod tcp;

pub use memory::{HandshakeReply, MemoryPeer, MemoryTransport};
pub use tcp::TcpTransport;

use crate::error::Result;
use crate::types::Endpoint;
use crate::wire::Frame;
use crossbeam_channel::Receiver;
use std::time::Duration;

/// Outbound half of a connection.
pub trait Link: Send + Sync {
    /// Send one frame. Blocks until it is handed to the OS (or the peer).
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// A freshly established connection.
pub struct Connected {
    pub link: Box<dyn Link>,
    pub inbound: Receiver<Frame>,
}

/// Opens connections to endpoints.
pub trait Transport: Send + Sync {
    /// Connect to `endpoint`, giving up after `timeout`.
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Connected>;
}
