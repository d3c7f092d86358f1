//! Secure layer — a pluggable, TLS-style handshake engine that interposes on
//! the session's read/write machinery.
//!
//! The [`HandshakeEngine`] trait is shaped like a standard cryptographic
//! session-establishment engine: `wrap`/`unwrap` move bytes between the
//! application and network sides, `status` reports what the state machine
//! needs next, and delegated tasks carry the expensive computation. The
//! shipped implementation is Noise_XX over `snow` with a
//! `[u16 BE length]` record layer.

mod channel;
mod context;
mod engine;
mod keys;

pub use channel::{SecureReader, SecureWriter};
pub use context::HandshakeContext;
pub use engine::{
    DelegatedTask, EngineOp, HandshakeEngine, HandshakeError, HandshakeStatus, NoiseEngine, Role,
};
pub use keys::Keypair;

/// Security settings for one endpoint. The same config serves both roles;
/// the accept/connect path picks the role.
pub struct SecurityConfig {
    pub keypair: Keypair,
    /// Remote static keys accepted during the handshake. `None` disables
    /// validation; `Some` rejects any peer whose key is not listed —
    /// rejection is a handshake failure, never a plaintext fallback.
    pub trusted_peers: Option<Vec<[u8; 32]>>,
}

impl SecurityConfig {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair, trusted_peers: None }
    }

    pub fn with_trusted_peers(keypair: Keypair, peers: Vec<[u8; 32]>) -> Self {
        Self { keypair, trusted_peers: Some(peers) }
    }
}
