//! Per-connection session: lifecycle state machine, the outbound API, and
//! the read/decode/dispatch loop.
//!
//! A session is born CONNECTING, moves to OPEN once the channel (and any
//! handshake) is established, and ends CLOSED. A graceful close passes
//! through CLOSING while queued writes drain; an immediate close discards
//! them. Every session terminates with exactly one `SessionClosed` event.

mod reader;
pub(crate) mod stream;
pub(crate) mod writer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tracing::debug;

use talus_core::pool::BufferPool;
use talus_core::protocol::{DecoderState, Protocol};
use talus_core::EngineConfig;

use crate::error::EngineError;
use crate::interfaces::{Filter, MessageProcessor, NetMonitor, SessionId, StateEvent};
use crate::transport::WriteTransport;

pub use stream::ChunkedWriter;

pub(crate) use reader::read_loop;
pub(crate) use writer::{OutBuf, WriteQueue, WriteRequest};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    /// Graceful close requested; queued writes still draining.
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

// ── Hooks ─────────────────────────────────────────────────────────────────────

/// The consumer-supplied collaborators a session dispatches into.
pub(crate) struct Hooks<T> {
    pub protocol: Arc<dyn Protocol<Msg = T>>,
    pub processor: Arc<dyn MessageProcessor<T>>,
    pub filters: Vec<Arc<dyn Filter<T>>>,
    pub monitor: Option<Arc<dyn NetMonitor>>,
}

impl<T> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            processor: self.processor.clone(),
            filters: self.filters.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Session<T> {
    id: SessionId,
    peer_addr: SocketAddr,
    /// Handshake-derived identity, shared with the peer. Plaintext sessions
    /// have none.
    secure_id: Option<[u8; 32]>,
    state: AtomicU8,
    user_paused: AtomicBool,
    closed_reported: AtomicBool,
    closed_notify: Notify,
    pub(crate) queue: WriteQueue,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) decoder: StdMutex<DecoderState>,
    pub(crate) writer: AsyncMutex<Option<WriteTransport>>,
    pub(crate) hooks: Hooks<T>,
}

impl<T: Send + 'static> Session<T> {
    pub(crate) fn new(
        peer_addr: SocketAddr,
        secure_id: Option<[u8; 32]>,
        pool: Arc<BufferPool>,
        config: Arc<EngineConfig>,
        hooks: Hooks<T>,
        writer: WriteTransport,
    ) -> Arc<Self> {
        let queue = WriteQueue::new(config.high_watermark, config.low_watermark);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            secure_id,
            state: AtomicU8::new(SessionState::Connecting as u8),
            user_paused: AtomicBool::new(false),
            closed_reported: AtomicBool::new(false),
            closed_notify: Notify::new(),
            queue,
            pool,
            config,
            decoder: StdMutex::new(DecoderState::new()),
            writer: AsyncMutex::new(Some(writer)),
            hooks,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handshake-derived session identity, identical on both peers.
    pub fn secure_session_id(&self) -> Option<[u8; 32]> {
        self.secure_id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Depth of the outbound queue, in buffers.
    pub fn write_queue_depth(&self) -> usize {
        self.queue.depth()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Mark the channel established and announce the session.
    pub(crate) fn open(self: &Arc<Self>) {
        let transitioned = self
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            debug!(session = self.id, peer = %self.peer_addr, "session open");
            self.emit(StateEvent::NewSession, None);
            for filter in &self.hooks.filters {
                filter.connected(self);
            }
        }
    }

    /// Close the session. Graceful (`immediate = false`) flushes the write
    /// queue first. Immediate discards queued writes and reaches CLOSED
    /// before returning, so a write issued afterwards is always refused;
    /// only the channel teardown runs asynchronously.
    pub fn close(self: &Arc<Self>, immediate: bool) {
        if immediate {
            if self.transition_closed() {
                let session = self.clone();
                tokio::spawn(async move {
                    session.teardown_channel().await;
                });
            }
            return;
        }

        let transitioned = self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            self.emit(StateEvent::SessionClosing, None);
            // The drain task finishes the close once the queue empties; if
            // none is running, start one so the transition always lands.
            if self.queue.try_acquire() {
                let session = self.clone();
                tokio::spawn(async move {
                    writer::drain(session).await;
                });
            }
        } else if self.state() == SessionState::Connecting {
            self.close(true);
        }
    }

    /// Final transition to CLOSED. Idempotent; reports `SessionClosed` once.
    pub(crate) async fn finalize_close(self: &Arc<Self>) {
        if self.transition_closed() {
            self.teardown_channel().await;
        }
    }

    /// Synchronous half of the final transition: state swap, queue discard,
    /// wakeups, and the single `SessionClosed` report. Once this returns the
    /// session refuses new writes.
    fn transition_closed(self: &Arc<Self>) -> bool {
        let prev = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if prev == SessionState::Closed as u8 {
            return false;
        }
        self.queue.clear();
        self.closed_notify.notify_waiters();
        self.queue.notify_resume();

        if !self.closed_reported.swap(true, Ordering::SeqCst) {
            debug!(session = self.id, peer = %self.peer_addr, "session closed");
            for filter in &self.hooks.filters {
                filter.closed(self);
            }
            self.hooks.processor.state_event(Some(self), StateEvent::SessionClosed, None);
        }
        true
    }

    async fn teardown_channel(self: &Arc<Self>) {
        // An active drain task holds the writer lock; it observes CLOSED and
        // shuts the channel down itself.
        if let Ok(mut guard) = self.writer.try_lock() {
            if let Some(writer) = guard.as_mut() {
                let _ = writer.shutdown().await;
            }
            *guard = None;
        }
    }

    /// Wait until the session reaches CLOSED.
    pub async fn closed(&self) {
        loop {
            if self.state() == SessionState::Closed {
                return;
            }
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == SessionState::Closed {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn closed_notify(&self) -> &Notify {
        &self.closed_notify
    }

    // ── Outbound API ──────────────────────────────────────────────────────

    /// Queue `data` for transmission. Returns as soon as the buffer is
    /// accepted; delivery is asynchronous and ordered.
    pub fn write(self: &Arc<Self>, data: Bytes) -> Result<(), EngineError> {
        self.enqueue(OutBuf::Shared(data), None)
    }

    /// Queue `data` and resolve once it has been fully written to the
    /// channel (not necessarily received by the peer).
    pub async fn write_with_notify(self: &Arc<Self>, data: Bytes) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(OutBuf::Shared(data), Some(tx))?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Encode `msg` through the session's protocol and queue the result.
    pub fn send(self: &Arc<Self>, msg: &T) -> Result<(), EngineError> {
        let bytes = self.hooks.protocol.encode(msg)?;
        self.write(bytes)
    }

    /// Pool-backed streaming writer for composing large payloads without an
    /// intermediate contiguous buffer.
    pub fn chunked_writer(self: &Arc<Self>) -> ChunkedWriter<T> {
        ChunkedWriter::new(self.clone())
    }

    pub(crate) fn enqueue(
        self: &Arc<Self>,
        buf: OutBuf,
        done: Option<writer::DoneTx>,
    ) -> Result<(), EngineError> {
        if self.state() != SessionState::Open {
            return Err(EngineError::Closed);
        }
        self.queue.push(WriteRequest::new(buf, done));
        if self.queue.try_acquire() {
            let session = self.clone();
            tokio::spawn(async move {
                writer::drain(session).await;
            });
        }
        Ok(())
    }

    // ── Read control ──────────────────────────────────────────────────────

    /// Stop pulling bytes from the channel. Kernel backpressure propagates
    /// to the peer while paused.
    pub fn pause_reads(&self) {
        self.user_paused.store(true, Ordering::Release);
    }

    pub fn resume_reads(&self) {
        self.user_paused.store(false, Ordering::Release);
        self.queue.notify_resume();
    }

    /// True when either the consumer or flow control has paused reads.
    pub fn reads_paused(&self) -> bool {
        self.user_paused.load(Ordering::Acquire) || self.queue.is_paused()
    }

    // ── Events ────────────────────────────────────────────────────────────

    pub(crate) fn emit(self: &Arc<Self>, event: StateEvent, error: Option<&EngineError>) {
        self.hooks.processor.state_event(Some(self), event, error);
    }
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("state", &SessionState::from_u8(self.state.load(Ordering::Acquire)))
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}
