//! Length-prefixed reference protocol: `[u32 BE length][payload]`.
//!
//! The simplest complete framing and the one the engine's own tests are
//! written against. Once the 4-byte header is complete it is consumed and the
//! pending payload length is parked in the session's [`DecoderState`], so a
//! header split across reads is parsed exactly once.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{DecodeError, DecoderState, FrameBuf, Protocol};

/// Payload length carried across reads after the header has been consumed.
struct PendingFrame {
    len: usize,
}

pub struct LengthPrefixed {
    max_frame: usize,
}

impl LengthPrefixed {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        // Matches the pool's default page size so a frame fits one chunk.
        Self::new(64 * 1024)
    }
}

impl Protocol for LengthPrefixed {
    type Msg = Bytes;

    fn decode(
        &self,
        buf: &mut FrameBuf<'_>,
        state: &mut DecoderState,
    ) -> Result<Option<Bytes>, DecodeError> {
        let pending = match state.take::<PendingFrame>() {
            Some(p) => p,
            None => {
                buf.mark();
                if buf.remaining() < 4 {
                    buf.reset();
                    return Ok(None);
                }
                let len = buf.get_u32() as usize;
                if len > self.max_frame {
                    return Err(DecodeError::FrameTooLarge { len, max: self.max_frame });
                }
                PendingFrame { len }
            }
        };

        if buf.remaining() < pending.len {
            // Header already consumed — remember how much payload is owed.
            state.set(pending);
            return Ok(None);
        }

        Ok(Some(buf.copy_to_bytes(pending.len)))
    }

    fn encode(&self, msg: &Bytes) -> Result<Bytes, DecodeError> {
        if msg.len() > self.max_frame {
            return Err(DecodeError::FrameTooLarge { len: msg.len(), max: self.max_frame });
        }
        let mut out = BytesMut::with_capacity(4 + msg.len());
        out.put_u32(msg.len() as u32);
        out.put_slice(msg);
        Ok(out.freeze())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
