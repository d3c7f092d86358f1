//! The session read loop: pull bytes from the transport, run the protocol
//! decoder over everything buffered, and dispatch complete frames through
//! the filter chain to the processor.
//!
//! Fatal conditions (decode failure, channel error) emit their exception
//! event and tear the session down; a processor failure is reported and the
//! session keeps reading.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use talus_core::pool::{BufferPool, Chunk, PoolError};
use talus_core::protocol::FrameBuf;

use crate::error::EngineError;
use crate::interfaces::StateEvent;
use crate::session::{Session, SessionState};
use crate::transport::ReadTransport;

// ── Read buffer ───────────────────────────────────────────────────────────────

/// Pool-backed accumulation buffer. Decoded bytes are drained from the
/// front; the buffer doubles when a frame outgrows it.
struct ReadBuffer {
    chunk: Chunk,
    filled: usize,
}

impl ReadBuffer {
    fn new(pool: &BufferPool, size: usize) -> Result<Self, PoolError> {
        Ok(Self { chunk: pool.allocate(size)?, filled: 0 })
    }

    fn data(&self) -> &[u8] {
        &self.chunk[..self.filled]
    }

    fn spare(&mut self) -> &mut [u8] {
        let filled = self.filled;
        &mut self.chunk[filled..]
    }

    fn is_full(&self) -> bool {
        self.filled == self.chunk.len()
    }

    /// Discard `n` decoded bytes from the front.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.filled);
        self.chunk.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    /// Double the buffer, carrying over unconsumed bytes. The old chunk
    /// returns to the pool.
    fn grow(&mut self, pool: &BufferPool) -> Result<(), PoolError> {
        let mut bigger = pool.allocate(self.chunk.len() * 2)?;
        bigger[..self.filled].copy_from_slice(&self.chunk[..self.filled]);
        self.chunk = bigger;
        Ok(())
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

pub(crate) async fn read_loop<T: Send + 'static>(
    session: Arc<Session<T>>,
    mut transport: ReadTransport,
) {
    let mut buf = match ReadBuffer::new(&session.pool, session.config.read_buffer_size) {
        Ok(buf) => buf,
        Err(e) => {
            let err = EngineError::Allocation(e);
            warn!(session = session.id(), error = %err, "read buffer allocation failed");
            session.emit(StateEvent::InputException, Some(&err));
            session.close(true);
            return;
        }
    };

    loop {
        if !wait_readable(&session).await {
            break;
        }

        if buf.is_full() {
            if let Err(e) = buf.grow(&session.pool) {
                let err = EngineError::Allocation(e);
                warn!(session = session.id(), error = %err, "read buffer grow failed");
                session.emit(StateEvent::InputException, Some(&err));
                session.close(true);
                break;
            }
            trace!(session = session.id(), size = buf.chunk.len(), "read buffer grown");
        }

        if let Some(monitor) = &session.hooks.monitor {
            monitor.before_read(session.id());
        }

        let closed = session.closed_notify().notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if session.state() == SessionState::Closed {
            break;
        }

        let n = tokio::select! {
            result = transport.read(buf.spare()) => match result {
                Ok(n) => n,
                Err(e) => {
                    let err = EngineError::Io(e);
                    warn!(session = session.id(), error = %err, "read failed; closing session");
                    session.emit(StateEvent::InputException, Some(&err));
                    session.close(true);
                    break;
                }
            },
            _ = &mut closed => break,
        };

        if n == 0 {
            debug!(session = session.id(), "peer shut down its output");
            session.emit(StateEvent::InputShutdown, None);
            session.close(false);
            break;
        }

        if let Some(monitor) = &session.hooks.monitor {
            monitor.after_read(session.id(), n);
        }
        buf.filled += n;

        if dispatch(&session, &mut buf).is_err() {
            break;
        }
    }
}

/// Park until reads are unpaused. Returns false once the session is closed.
async fn wait_readable<T: Send + 'static>(session: &Arc<Session<T>>) -> bool {
    loop {
        if session.state() >= SessionState::Closing {
            return false;
        }
        if !session.reads_paused() {
            return true;
        }
        let resume = session.queue.resume_notify().notified();
        tokio::pin!(resume);
        resume.as_mut().enable();
        // Re-check after registering: the unpause may have already fired.
        if session.state() >= SessionState::Closing {
            return false;
        }
        if !session.reads_paused() {
            return true;
        }
        resume.await;
    }
}

/// Decode and dispatch every complete frame in the buffer. `Err` means the
/// session is fatally closed.
fn dispatch<T: Send + 'static>(session: &Arc<Session<T>>, buf: &mut ReadBuffer) -> Result<(), ()> {
    loop {
        let decoded = {
            let mut frame = FrameBuf::new(buf.data());
            let mut state = session.decoder.lock().expect("decoder poisoned");
            let result = session.hooks.protocol.decode(&mut frame, &mut state);
            (result, frame.position())
        };

        match decoded {
            (Ok(Some(msg)), consumed) => {
                buf.consume(consumed);
                for filter in &session.hooks.filters {
                    filter.read_filter(session, consumed);
                }
                let mut deliver = true;
                for filter in &session.hooks.filters {
                    if !filter.process_filter(session, &msg) {
                        deliver = false;
                        break;
                    }
                }
                if deliver {
                    if let Err(e) = session.hooks.processor.process(session, &msg) {
                        let err = EngineError::Process(e);
                        debug!(session = session.id(), error = %err, "processor failed");
                        session.emit(StateEvent::ProcessException, Some(&err));
                        for filter in &session.hooks.filters {
                            filter.process_fail(session, &msg, &err);
                        }
                    }
                }
                // A decoder that produces without consuming cannot make
                // progress against this buffer.
                if consumed == 0 {
                    return Ok(());
                }
            }
            (Ok(None), consumed) => {
                buf.consume(consumed);
                return Ok(());
            }
            (Err(e), _) => {
                let err = EngineError::Decode(e);
                warn!(session = session.id(), error = %err, "decode failed; closing session");
                session.emit(StateEvent::DecodeException, Some(&err));
                session.close(true);
                return Err(());
            }
        }
    }
}
