//! Flow-controlled write pipeline.
//!
//! Outbound buffers land in a per-session FIFO queue. A single drain task
//! owns the socket while it runs (the gate guarantees one write in flight),
//! pulls bounded batches, and pushes them out with scatter-gather writes.
//! Queue depth drives read-side backpressure: reads pause when the depth
//! crosses the high watermark and resume only once it falls back to the low
//! watermark, so a queue hovering near the boundary cannot flap.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use talus_core::pool::Chunk;

use crate::error::EngineError;
use crate::interfaces::StateEvent;
use crate::session::{Session, SessionState};

// ── Outbound buffers ──────────────────────────────────────────────────────────

pub(crate) enum OutBuf {
    /// Pool-backed chunk, valid up to `filled`. Returns to the pool when the
    /// request is dropped.
    Pooled { chunk: Chunk, filled: usize },
    Shared(Bytes),
}

impl OutBuf {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Pooled { chunk, filled } => &chunk[..*filled],
            Self::Shared(bytes) => bytes,
        }
    }
}

pub(crate) type DoneTx = oneshot::Sender<Result<(), EngineError>>;

pub(crate) struct WriteRequest {
    buf: OutBuf,
    written: usize,
    done: Option<DoneTx>,
}

impl WriteRequest {
    pub(crate) fn new(buf: OutBuf, done: Option<DoneTx>) -> Self {
        Self { buf, written: 0, done }
    }

    fn pending(&self) -> &[u8] {
        &self.buf.bytes()[self.written..]
    }

    fn total_len(&self) -> usize {
        self.buf.bytes().len()
    }

    fn complete(mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail(mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Err(EngineError::Closed));
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

pub(crate) struct WriteQueue {
    inner: Mutex<VecDeque<WriteRequest>>,
    /// Requests accepted but not yet fully written, including any batch the
    /// drain task currently holds.
    depth: AtomicUsize,
    /// One-write-in-flight gate; held by the active drain task.
    draining: AtomicBool,
    paused: AtomicBool,
    high: usize,
    low: usize,
    resume: Notify,
}

impl WriteQueue {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            high,
            low,
            resume: Notify::new(),
        }
    }

    pub(crate) fn push(&self, req: WriteRequest) {
        // The depth update and the pause decision stay under the queue lock;
        // interleaving them with a concurrent unpause can strand the flag.
        let mut queue = self.inner.lock().expect("write queue poisoned");
        queue.push_back(req);
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth >= self.high && !self.paused.swap(true, Ordering::AcqRel) {
            debug!(depth, high = self.high, "write queue crossed high watermark; pausing reads");
        }
    }

    fn pop_batch(&self, max: usize) -> Vec<WriteRequest> {
        let mut queue = self.inner.lock().expect("write queue poisoned");
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    fn requeue_front(&self, requests: Vec<WriteRequest>) {
        let mut queue = self.inner.lock().expect("write queue poisoned");
        for req in requests.into_iter().rev() {
            queue.push_front(req);
        }
    }

    /// Account for `n` requests leaving the pipeline. Lifts the read pause
    /// once the depth drops to the low watermark.
    fn on_complete(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _queue = self.inner.lock().expect("write queue poisoned");
        let depth = self.depth.fetch_sub(n, Ordering::AcqRel) - n;
        if depth <= self.low && self.paused.swap(false, Ordering::AcqRel) {
            trace!(depth, low = self.low, "write queue drained to low watermark; resuming reads");
            self.resume.notify_waiters();
        }
    }

    /// Drop everything still queued, failing their completion notices.
    pub(crate) fn clear(&self) {
        let dropped: Vec<WriteRequest> = {
            let mut queue = self.inner.lock().expect("write queue poisoned");
            queue.drain(..).collect()
        };
        let n = dropped.len();
        for req in dropped {
            req.fail();
        }
        self.on_complete(n);
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_gate(&self) {
        self.draining.store(false, Ordering::Release);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().expect("write queue poisoned").is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn resume_notify(&self) -> &Notify {
        &self.resume
    }

    pub(crate) fn notify_resume(&self) {
        self.resume.notify_waiters();
    }
}

// ── Drain task ────────────────────────────────────────────────────────────────

/// Drain the session's write queue. Exactly one instance runs at a time; the
/// caller must have acquired the gate.
pub(crate) async fn drain<T: Send + 'static>(session: Arc<Session<T>>) {
    loop {
        // The transport moves out of the slot for the drain's duration; the
        // held guard keeps close paths from touching it concurrently.
        let mut writer_guard = session.writer.lock().await;
        let Some(mut writer) = writer_guard.take() else {
            drop(writer_guard);
            // A push can race the close's final queue clear; nothing will
            // drain it now, so fail it here.
            session.queue.clear();
            session.queue.release_gate();
            return;
        };

        loop {
            if session.state() == SessionState::Closed {
                let _ = writer.shutdown().await;
                break;
            }

            let mut batch = session.queue.pop_batch(session.config.write_batch_limit);
            if batch.is_empty() {
                break;
            }

            let result = {
                let slices: Vec<IoSlice<'_>> =
                    batch.iter().map(|req| IoSlice::new(req.pending())).collect();
                let total: usize = slices.iter().map(|s| s.len()).sum();
                if let Some(monitor) = &session.hooks.monitor {
                    monitor.before_write(session.id(), total);
                }
                writer.write_vectored(&slices).await
            };

            match result {
                Ok(mut n) => {
                    if let Some(monitor) = &session.hooks.monitor {
                        monitor.after_write(session.id(), n);
                    }
                    let mut completed = 0usize;
                    let mut rest = batch.into_iter();
                    let mut leftover = Vec::new();
                    while let Some(mut req) = rest.next() {
                        let pending = req.pending().len();
                        if n >= pending {
                            n -= pending;
                            let size = req.total_len();
                            req.complete();
                            completed += 1;
                            for filter in &session.hooks.filters {
                                filter.write_filter(&session, size);
                            }
                        } else {
                            // Partial write: keep the rest at the queue head.
                            req.written += n;
                            leftover.push(req);
                            leftover.extend(rest);
                            break;
                        }
                    }
                    if !leftover.is_empty() {
                        session.queue.requeue_front(leftover);
                    }
                    session.queue.on_complete(completed);
                }
                Err(e) => {
                    warn!(session = session.id(), error = %e, "write failed; closing session");
                    let err = EngineError::Io(e);
                    session.emit(StateEvent::OutputException, Some(&err));
                    let n = batch.len();
                    for req in batch {
                        req.fail();
                    }
                    session.queue.on_complete(n);
                    let _ = writer.shutdown().await;
                    drop(writer_guard);
                    session.queue.release_gate();
                    session.finalize_close().await;
                    return;
                }
            }
        }

        if session.state() == SessionState::Closed {
            let _ = writer.shutdown().await;
        } else {
            *writer_guard = Some(writer);
        }
        drop(writer_guard);
        session.queue.release_gate();

        // A push may have raced the gate release; re-check before parking.
        if !session.queue.is_empty() && session.queue.try_acquire() {
            continue;
        }
        if session.state() == SessionState::Closing && session.queue.is_empty() {
            session.finalize_close().await;
        }
        return;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
