//! Consumer-facing interfaces: the message processor, the ordered filter
//! hooks around the decode/dispatch/write pipeline, and the connection-level
//! net monitor. The engine calls these; it never implements them.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::error::EngineError;
use crate::session::Session;

/// Process-local session identity.
pub type SessionId = u64;

/// Lifecycle and failure notifications delivered through
/// [`MessageProcessor::state_event`].
///
/// Session-fatal conditions produce exactly one exception-carrying event
/// followed by `SessionClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    NewSession,
    /// Peer shut down its output; EOF on read.
    InputShutdown,
    /// The consumer's processor failed. Session stays open.
    ProcessException,
    /// The protocol rejected the byte stream. Session-fatal.
    DecodeException,
    /// Read-side channel failure. Session-fatal.
    InputException,
    /// Write-side channel failure. Session-fatal.
    OutputException,
    SessionClosing,
    SessionClosed,
    /// An inbound connection was vetoed by the monitor.
    RejectAccept,
    /// The accept pipeline failed before a session existed.
    AcceptException,
}

/// Consumer of decoded messages and session lifecycle events.
pub trait MessageProcessor<T>: Send + Sync + 'static {
    /// Handle one decoded frame. An error is reported as `ProcessException`
    /// and routed through [`Filter::process_fail`]; the session stays open.
    fn process(&self, session: &Arc<Session<T>>, msg: &T) -> anyhow::Result<()>;

    /// Lifecycle notification. `session` is `None` for events that precede
    /// session creation (`RejectAccept`, `AcceptException`).
    fn state_event(
        &self,
        _session: Option<&Arc<Session<T>>>,
        _event: StateEvent,
        _error: Option<&EngineError>,
    ) {
    }
}

/// Ordered hooks around the decode/dispatch/write pipeline. All hooks default
/// to no-ops; implement only what you need.
pub trait Filter<T>: Send + Sync + 'static {
    fn connected(&self, _session: &Arc<Session<T>>) {}

    fn closed(&self, _session: &Arc<Session<T>>) {}

    /// Called with the consumed byte count after each decoded frame.
    fn read_filter(&self, _session: &Arc<Session<T>>, _size: usize) {}

    /// Called before the processor sees the message. Returning `false`
    /// swallows the message without dispatching it.
    fn process_filter(&self, _session: &Arc<Session<T>>, _msg: &T) -> bool {
        true
    }

    fn process_fail(&self, _session: &Arc<Session<T>>, _msg: &T, _error: &EngineError) {}

    /// Called with the flushed byte count after each completed write buffer.
    fn write_filter(&self, _session: &Arc<Session<T>>, _size: usize) {}
}

/// Connection-level observation and veto, below the protocol layer.
pub trait NetMonitor: Send + Sync + 'static {
    /// Veto an inbound connection before any session exists.
    fn should_accept(&self, _channel: &TcpStream) -> bool {
        true
    }

    fn before_read(&self, _session: SessionId) {}

    fn after_read(&self, _session: SessionId, _size: usize) {}

    fn before_write(&self, _session: SessionId, _size: usize) {}

    fn after_write(&self, _session: SessionId, _size: usize) {}
}
