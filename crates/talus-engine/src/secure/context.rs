//! Handshake driver. Pumps a [`HandshakeEngine`] over a live TCP stream
//! until the session is established, keeping delegated tasks off the I/O
//! context via `spawn_blocking`.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::engine::{EngineOp, HandshakeEngine, HandshakeError, HandshakeStatus};

/// Initial capacity for the handshake-side network buffers. Grown on demand
/// when the engine reports overflow.
const INITIAL_BUF: usize = 1024;

pub struct HandshakeContext {
    engine: Arc<dyn HandshakeEngine>,
    /// Unconsumed network bytes, carried across reads and into the
    /// established channel.
    net_in: Vec<u8>,
    net_out: Vec<u8>,
}

impl HandshakeContext {
    pub fn new(engine: Arc<dyn HandshakeEngine>) -> Self {
        Self {
            engine,
            net_in: Vec::with_capacity(INITIAL_BUF),
            net_out: vec![0u8; INITIAL_BUF],
        }
    }

    /// Run the handshake to completion over `stream`. Returns once the
    /// engine reports `Finished`; any failure aborts the session.
    pub async fn drive(&mut self, stream: &mut TcpStream) -> Result<(), HandshakeError> {
        loop {
            match self.engine.status() {
                HandshakeStatus::NeedWrap => self.pump_out(stream).await?,
                HandshakeStatus::NeedUnwrap => self.pump_in(stream).await?,
                HandshakeStatus::NeedTask => {
                    let task = self.engine.take_task().ok_or(HandshakeError::TaskLost)?;
                    // Key agreement is CPU work; keep it off the I/O context.
                    tokio::task::spawn_blocking(task)
                        .await
                        .map_err(|_| HandshakeError::TaskLost)??;
                }
                HandshakeStatus::Finished => return Ok(()),
                HandshakeStatus::NotHandshaking => return Err(HandshakeError::BadState),
            }
        }
    }

    async fn pump_out(&mut self, stream: &mut TcpStream) -> Result<(), HandshakeError> {
        loop {
            match self.engine.wrap(&[], &mut self.net_out)? {
                EngineOp::Done { produced, .. } => {
                    stream.write_all(&self.net_out[..produced]).await?;
                    return Ok(());
                }
                EngineOp::BufferOverflow { needed } => {
                    let grown = needed.max(self.net_out.len() * 2);
                    self.net_out.resize(grown, 0);
                }
                EngineOp::BufferUnderflow => return Err(HandshakeError::BadState),
            }
        }
    }

    async fn pump_in(&mut self, stream: &mut TcpStream) -> Result<(), HandshakeError> {
        loop {
            // Handshake unwrap produces no application bytes.
            let mut sink = [0u8; 0];
            match self.engine.unwrap(&self.net_in, &mut sink)? {
                EngineOp::Done { consumed, .. } => {
                    self.net_in.drain(..consumed);
                    return Ok(());
                }
                EngineOp::BufferUnderflow => {
                    let mut chunk = [0u8; INITIAL_BUF];
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(HandshakeError::PrematureEof);
                    }
                    self.net_in.extend_from_slice(&chunk[..n]);
                }
                EngineOp::BufferOverflow { .. } => return Err(HandshakeError::BadState),
            }
        }
    }

    /// Hand the established engine and any already-buffered network bytes to
    /// the secure channel halves.
    pub fn into_parts(self) -> (Arc<dyn HandshakeEngine>, Vec<u8>) {
        (self.engine, self.net_in)
    }
}
