//! Engine error taxonomy.
//!
//! Decode and process errors are caught at the engine boundary and surfaced
//! once via `state_event`; I/O and handshake failures are session-fatal. A
//! session never disappears without a `SessionClosed` notification.

use thiserror::Error;

use crate::secure::HandshakeError;
use talus_core::pool::PoolError;
use talus_core::protocol::DecodeError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The pool rejected a request and no fallback is configured.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] PoolError),

    /// Malformed frame. Session-fatal.
    #[error("protocol decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The consumer's processor reported a failure. The session stays open.
    #[error("message processing failed: {0}")]
    Process(#[source] anyhow::Error),

    /// A channel callback reported failure. Session-fatal.
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The secure layer could not establish or continue the session.
    /// Session-fatal — never a silent fallback to plaintext.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Operation on a session that is closing or closed.
    #[error("session is closed")]
    Closed,
}
