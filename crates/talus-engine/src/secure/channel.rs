//! Established-session channel halves. Each half drives the shared engine in
//! transport mode: the reader unwraps records into plaintext, the writer
//! wraps plaintext into records. The engine's cipher state is internally
//! synchronized, so the halves run on independent tasks.

use std::io::{self, IoSlice};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::engine::{EngineOp, HandshakeEngine, HandshakeError, MAX_PLAIN};

fn secure_err(e: HandshakeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct SecureReader {
    half: OwnedReadHalf,
    engine: Arc<dyn HandshakeEngine>,
    /// Unconsumed network bytes, seeded with handshake leftovers.
    net: Vec<u8>,
    /// Decrypted plaintext not yet handed to the caller.
    stash: Vec<u8>,
    stash_pos: usize,
}

impl SecureReader {
    pub fn new(half: OwnedReadHalf, engine: Arc<dyn HandshakeEngine>, leftover: Vec<u8>) -> Self {
        Self {
            half,
            engine,
            net: leftover,
            stash: vec![0u8; MAX_PLAIN + 256],
            stash_pos: 0,
        }
    }

    /// Read decrypted bytes into `buf`. Returns 0 only on a clean EOF at a
    /// record boundary; EOF mid-record is an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.stash_pos > 0 {
                let n = buf.len().min(self.stash_pos);
                buf[..n].copy_from_slice(&self.stash[..n]);
                self.stash.copy_within(n..self.stash_pos, 0);
                self.stash_pos -= n;
                return Ok(n);
            }

            match self
                .engine
                .unwrap(&self.net, &mut self.stash)
                .map_err(secure_err)?
            {
                EngineOp::Done { consumed, produced } => {
                    self.net.drain(..consumed);
                    self.stash_pos = produced;
                    // A zero-length record carries no data; keep reading.
                }
                EngineOp::BufferOverflow { needed } => {
                    self.stash.resize(needed, 0);
                }
                EngineOp::BufferUnderflow => {
                    let mut chunk = [0u8; 4096];
                    let n = self.half.read(&mut chunk).await?;
                    if n == 0 {
                        if self.net.is_empty() {
                            return Ok(0);
                        }
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-record",
                        ));
                    }
                    self.net.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct SecureWriter {
    half: OwnedWriteHalf,
    engine: Arc<dyn HandshakeEngine>,
    record: Vec<u8>,
}

impl SecureWriter {
    pub fn new(half: OwnedWriteHalf, engine: Arc<dyn HandshakeEngine>) -> Self {
        Self {
            half,
            engine,
            record: vec![0u8; 2 + MAX_PLAIN + 256],
        }
    }

    /// Encrypt and flush every byte of `bufs`. Unlike a raw socket this
    /// cannot partially write: once plaintext is wrapped its record must hit
    /// the wire or the cipher streams desync. Returns the plaintext total.
    pub async fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs {
            let mut rest: &[u8] = buf;
            while !rest.is_empty() {
                match self.engine.wrap(rest, &mut self.record).map_err(secure_err)? {
                    EngineOp::Done { consumed, produced } => {
                        self.half.write_all(&self.record[..produced]).await?;
                        rest = &rest[consumed..];
                        total += consumed;
                    }
                    EngineOp::BufferOverflow { needed } => {
                        self.record.resize(needed, 0);
                    }
                    EngineOp::BufferUnderflow => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "engine underflow on write",
                        ));
                    }
                }
            }
        }
        Ok(total)
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}
