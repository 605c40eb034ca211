//! Sessions: live connections with handshake coordination and health state.
//!
//! A [`Session`] is created once a transport connects. Its dispatcher thread
//! resolves the [`HandshakeCoordinator`], applies `Suspend`/`Disconnect` to the
//! [`SessionState`], and passes every other inbound frame to a
//! [`SessionListener`].

mod handshake;
mod outbound;
#[allow(clippy::module_inception)]
mod session;
mod state;

pub use handshake::{HandshakeCoordinator, HandshakeOutcome};
pub use outbound::OutboundQueue;
pub use session::{Session, SessionRole};
pub use state::SessionState;

use crate::error::Result;
use crate::wire::Frame;
use std::sync::Arc;

/// Observer of session lifecycle and inbound frames.
///
/// Callbacks run on the session's dispatcher thread. An error from
/// [`on_frame`](Self::on_frame) is treated as a protocol violation and closes
/// the session.
pub trait SessionListener: Send + Sync {
    /// A session finished its handshake and was installed.
    fn on_session_opened(&self, _session: &Arc<Session>) {}

    fn on_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<()>;

    /// The session closed. Called once per session.
    fn on_session_closed(&self, _session: &Arc<Session>) {}
}
