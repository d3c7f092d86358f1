//! Message-framing contract consumed by the session engine.
//!
//! A [`Protocol`] turns the raw byte stream into application messages and
//! back. The engine invokes `decode` repeatedly against the undecoded window
//! of the session's read buffer; `decode` must never consume bytes it cannot
//! fully interpret — on a short or ambiguous read it restores the position
//! (mark/reset) and returns `Ok(None)`, and the engine re-invokes it once
//! more bytes have arrived. State that must survive across partial reads
//! lives in the protocol-owned [`DecoderState`] attached to the session,
//! never re-derived from scratch.

use std::any::Any;

use bytes::Bytes;
use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────────────

/// A malformed frame. Decode errors are session-fatal: the engine reports
/// them once and closes the session.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("message cannot be encoded: {0}")]
    Encode(String),
}

// ── Frame buffer ──────────────────────────────────────────────────────────────

/// Position/limit view over the undecoded bytes of a read buffer.
///
/// Bytes before the position are consumed and must not be re-read; bytes
/// past the limit do not exist for the decoder. `mark`/`reset` implement the
/// restore discipline for incomplete frames.
pub struct FrameBuf<'a> {
    data: &'a [u8],
    pos: usize,
    mark: Option<usize>,
}

impl<'a> FrameBuf<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, mark: None }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Remember the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.mark = Some(self.pos);
    }

    /// Restore the position saved by the last `mark`. Without a mark this
    /// rewinds to the start of the window.
    pub fn reset(&mut self) {
        self.pos = self.mark.unwrap_or(0);
    }

    /// The unconsumed window.
    pub fn chunk(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.pos += n;
    }

    pub fn get_u8(&mut self) -> u8 {
        let b = self.data[self.pos];
        self.pos += 1;
        b
    }

    pub fn get_u16(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        self.copy_to_slice(&mut raw);
        u16::from_be_bytes(raw)
    }

    pub fn get_u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        self.copy_to_slice(&mut raw);
        u32::from_be_bytes(raw)
    }

    pub fn copy_to_slice(&mut self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.data[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
    }

    /// Copy the next `n` bytes out as an owned [`Bytes`].
    pub fn copy_to_bytes(&mut self, n: usize) -> Bytes {
        let out = Bytes::copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        out
    }
}

// ── Decoder state ─────────────────────────────────────────────────────────────

/// Protocol-owned state carried across partial reads, opaque to the engine.
///
/// One slot per session. The protocol decides what lives here — typically a
/// partially parsed header. The engine only moves it around.
#[derive(Default)]
pub struct DecoderState(Option<Box<dyn Any + Send>>);

impl DecoderState {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn set<S: Any + Send>(&mut self, state: S) {
        self.0 = Some(Box::new(state));
    }

    pub fn get<S: Any + Send>(&self) -> Option<&S> {
        self.0.as_ref().and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<S: Any + Send>(&mut self) -> Option<&mut S> {
        self.0.as_mut().and_then(|b| b.downcast_mut())
    }

    pub fn take<S: Any + Send>(&mut self) -> Option<S> {
        match self.0.take() {
            Some(b) => match b.downcast::<S>() {
                Ok(s) => Some(*s),
                Err(b) => {
                    self.0 = Some(b);
                    None
                }
            },
            None => None,
        }
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Decode/encode contract, independent of transport.
pub trait Protocol: Send + Sync + 'static {
    type Msg: Send + 'static;

    /// Extract one frame from `buf`, or return `Ok(None)` if no complete
    /// frame is available — in which case the position must be left exactly
    /// where the call found it, unless consumed bytes are accounted for in
    /// `state`.
    fn decode(
        &self,
        buf: &mut FrameBuf<'_>,
        state: &mut DecoderState,
    ) -> Result<Option<Self::Msg>, DecodeError>;

    /// Serialize one message. Stateless: the same message always yields the
    /// same bytes.
    fn encode(&self, msg: &Self::Msg) -> Result<Bytes, DecodeError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
