//! talus-core — pooled buffer allocator, message-framing contract, and
//! engine configuration. The transport-facing engine crate depends on this
//! one; nothing here touches a socket.

pub mod codec;
pub mod config;
pub mod pool;
pub mod protocol;

pub use codec::LengthPrefixed;
pub use config::{EngineConfig, PoolSettings};
pub use pool::{Backing, BufferPool, Chunk, FallbackPolicy, PoolConfig, PoolError};
pub use protocol::{DecodeError, DecoderState, FrameBuf, Protocol};
