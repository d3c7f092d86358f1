//! Chunked output stream: compose a large payload into pool-backed chunks
//! that enter the write queue as each one fills, so the full payload never
//! needs a contiguous allocation.

use std::sync::Arc;

use talus_core::pool::Chunk;

use crate::error::EngineError;
use crate::session::{OutBuf, Session};

pub struct ChunkedWriter<T: Send + 'static> {
    session: Arc<Session<T>>,
    chunk: Option<Chunk>,
    filled: usize,
}

impl<T: Send + 'static> ChunkedWriter<T> {
    pub(crate) fn new(session: Arc<Session<T>>) -> Self {
        Self { session, chunk: None, filled: 0 }
    }

    /// Append `data`, flushing full chunks into the write queue as it goes.
    /// Chunks are queued in append order, so the stream arrives in order.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), EngineError> {
        while !data.is_empty() {
            if self.chunk.is_none() {
                self.chunk =
                    Some(self.session.pool.allocate(self.session.config.write_chunk_size)?);
                self.filled = 0;
            }
            let chunk = self.chunk.as_mut().expect("chunk present");
            let room = chunk.len() - self.filled;
            let take = room.min(data.len());
            chunk[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == chunk.len() {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Queue the current partial chunk, if any.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if let Some(chunk) = self.chunk.take() {
            if self.filled > 0 {
                let filled = self.filled;
                self.filled = 0;
                self.session.enqueue(OutBuf::Pooled { chunk, filled }, None)?;
            }
        }
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.filled
    }
}

/// Unflushed data is queued on drop; a closed session discards it.
impl<T: Send + 'static> Drop for ChunkedWriter<T> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
