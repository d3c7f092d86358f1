//! talus-engine — the per-connection I/O engine.
//!
//! Sessions drive a read→decode→dispatch cycle against a pluggable
//! [`Protocol`](talus_core::Protocol), batch outbound buffers through a
//! flow-controlled write pipeline, and optionally interpose a Noise-based
//! secure layer beneath the plaintext machinery. Consumers plug in via the
//! traits in [`interfaces`].

pub mod client;
pub mod error;
pub mod interfaces;
pub mod secure;
pub mod server;
pub mod session;

pub(crate) mod transport;

pub use client::connect;
pub use error::EngineError;
pub use interfaces::{Filter, MessageProcessor, NetMonitor, SessionId, StateEvent};
pub use secure::{HandshakeError, Keypair, SecurityConfig};
pub use server::{SessionTable, SocketServer};
pub use session::{ChunkedWriter, Session, SessionState};
