//! The handshake engine abstraction and its Noise_XX implementation.
//!
//! The trait mirrors a standard TLS-style engine: `status` says what the
//! state machine needs next, `wrap`/`unwrap` move one record at a time
//! between the application and network sides, and DH-heavy steps surface as
//! delegated tasks so callers can run them off the I/O context.
//!
//! Record layer: every engine output is framed `[u16 BE length][body]`.
//! `unwrap` never consumes a partial record and never consumes at all when
//! the destination cannot hold the result, so callers can always retry after
//! growing a buffer.

use std::sync::{Arc, Mutex};

use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;

use super::keys::Keypair;

/// The Noise pattern used for session establishment: mutual authentication,
/// both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// AEAD tag appended to every transport record body.
const TAG_LEN: usize = 16;

/// Plaintext ceiling per transport record. Keeps records well under the
/// u16 record length and snow's 64 KiB message limit.
pub(crate) const MAX_PLAIN: usize = 16 * 1024;

// ── Status and results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine needs bytes from the peer.
    NeedUnwrap,
    /// The engine has bytes to put on the wire.
    NeedWrap,
    /// Delegated computation must run before the handshake can continue.
    NeedTask,
    /// Handshake just completed; reported once.
    Finished,
    NotHandshaking,
}

/// Outcome of one `wrap`/`unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Done { consumed: usize, produced: usize },
    /// Destination too small. Retry with at least `needed` bytes.
    BufferOverflow { needed: usize },
    /// Source does not hold a complete record yet.
    BufferUnderflow,
}

/// Delegated handshake computation. Runs off the I/O context; the engine
/// observes completion through its shared state.
pub type DelegatedTask = Box<dyn FnOnce() -> Result<(), HandshakeError> + Send + 'static>;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("invalid noise pattern string")]
    BadPattern,

    #[error("peer static key is not in the trusted set")]
    UntrustedPeer,

    #[error("record body of {0} bytes exceeds the record layer limit")]
    RecordTooLarge(usize),

    #[error("connection closed before the handshake completed")]
    PrematureEof,

    #[error("engine driven in an invalid state")]
    BadState,

    #[error("delegated handshake task was lost")]
    TaskLost,

    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Engine trait ──────────────────────────────────────────────────────────────

pub trait HandshakeEngine: Send + Sync + 'static {
    fn status(&self) -> HandshakeStatus;

    /// Move application bytes (or pending handshake output) into a wire
    /// record written to `dst`.
    fn wrap(&self, src: &[u8], dst: &mut [u8]) -> Result<EngineOp, HandshakeError>;

    /// Consume one wire record from `src`, producing application bytes in
    /// `dst` (none during the handshake).
    fn unwrap(&self, src: &[u8], dst: &mut [u8]) -> Result<EngineOp, HandshakeError>;

    /// Take the pending delegated task, if the status is `NeedTask`.
    fn take_task(&self) -> Option<DelegatedTask>;

    /// Stable 32-byte session id, identical on both peers once established.
    fn session_id(&self) -> Option<[u8; 32]>;

    /// The peer's authenticated static key, once known.
    fn peer_static_key(&self) -> Option<[u8; 32]>;
}

// ── Noise implementation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

enum Phase {
    /// A handshake record body staged for the next `wrap`.
    StagedWrite(Vec<u8>),
    /// Expecting the next handshake record from the peer.
    AwaitRead,
    /// Delegated work queued; for the initiator it carries the peer's
    /// message 2 body.
    TaskPending(Option<Vec<u8>>),
    TaskRunning,
    Transport,
    Failed,
}

struct Inner {
    hs: Option<HandshakeState>,
    transport: Option<TransportState>,
    phase: Phase,
    role: Role,
    trusted: Option<Vec<[u8; 32]>>,
    session_id: Option<[u8; 32]>,
    peer_key: Option<[u8; 32]>,
    /// Set on the first transport-mode operation; `Finished` is reported
    /// until then.
    established_seen: bool,
}

/// Noise_XX engine. Clonable handle over shared state so the post-handshake
/// reader and writer can drive the same cipher.
#[derive(Clone)]
pub struct NoiseEngine {
    inner: Arc<Mutex<Inner>>,
}

impl NoiseEngine {
    pub fn new(
        keypair: &Keypair,
        role: Role,
        trusted: Option<Vec<[u8; 32]>>,
    ) -> Result<Self, HandshakeError> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|_| HandshakeError::BadPattern)?)
            .local_private_key(keypair.private());

        let (hs, phase) = match role {
            Role::Initiator => {
                let mut hs = builder.build_initiator()?;
                // Message 1 carries only the ephemeral key; produce it now.
                let mut msg1 = vec![0u8; 128];
                let len = hs.write_message(&[], &mut msg1)?;
                msg1.truncate(len);
                (hs, Phase::StagedWrite(msg1))
            }
            Role::Responder => (builder.build_responder()?, Phase::AwaitRead),
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                hs: Some(hs),
                transport: None,
                phase,
                role,
                trusted,
                session_id: None,
                peer_key: None,
                established_seen: false,
            })),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("noise engine poisoned")
    }
}

impl Inner {
    fn fail<T>(&mut self, err: HandshakeError) -> Result<T, HandshakeError> {
        self.phase = Phase::Failed;
        Err(err)
    }

    fn check_trusted(&self, remote: &[u8]) -> Result<[u8; 32], HandshakeError> {
        let mut key = [0u8; 32];
        if remote.len() != 32 {
            return Err(HandshakeError::UntrustedPeer);
        }
        key.copy_from_slice(remote);
        if let Some(trusted) = &self.trusted {
            if !trusted.contains(&key) {
                return Err(HandshakeError::UntrustedPeer);
            }
        }
        Ok(key)
    }

    /// Validate the peer, derive the session id, and switch to transport
    /// mode. Called once the final handshake message has been processed.
    fn establish(&mut self) -> Result<(), HandshakeError> {
        let hs = self.hs.as_mut().ok_or(HandshakeError::BadState)?;
        let remote = hs.get_remote_static().ok_or(HandshakeError::UntrustedPeer)?.to_vec();
        self.peer_key = Some(self.check_trusted(&remote)?);

        let hs = self.hs.take().expect("handshake state present");
        // Both peers share the handshake hash; BLAKE3 of it is the session id.
        self.session_id = Some(*blake3::hash(hs.get_handshake_hash()).as_bytes());
        self.transport = Some(hs.into_transport_mode()?);
        Ok(())
    }
}

/// Parse one `[u16 BE length][body]` record from the front of `src`.
fn parse_record(src: &[u8]) -> Option<(usize, usize)> {
    if src.len() < 2 {
        return None;
    }
    let body_len = u16::from_be_bytes([src[0], src[1]]) as usize;
    if src.len() < 2 + body_len {
        return None;
    }
    Some((body_len, 2 + body_len))
}

fn put_record(body: &[u8], dst: &mut [u8]) -> usize {
    dst[..2].copy_from_slice(&(body.len() as u16).to_be_bytes());
    dst[2..2 + body.len()].copy_from_slice(body);
    2 + body.len()
}

impl HandshakeEngine for NoiseEngine {
    fn status(&self) -> HandshakeStatus {
        let inner = self.lock();
        match &inner.phase {
            Phase::StagedWrite(_) => HandshakeStatus::NeedWrap,
            Phase::AwaitRead => HandshakeStatus::NeedUnwrap,
            Phase::TaskPending(_) | Phase::TaskRunning => HandshakeStatus::NeedTask,
            Phase::Transport => {
                if inner.established_seen {
                    HandshakeStatus::NotHandshaking
                } else {
                    HandshakeStatus::Finished
                }
            }
            Phase::Failed => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&self, src: &[u8], dst: &mut [u8]) -> Result<EngineOp, HandshakeError> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.phase, Phase::TaskRunning) {
            Phase::StagedWrite(body) => {
                let needed = 2 + body.len();
                if dst.len() < needed {
                    inner.phase = Phase::StagedWrite(body);
                    return Ok(EngineOp::BufferOverflow { needed });
                }
                let produced = put_record(&body, dst);
                inner.phase = if inner.transport.is_some() {
                    Phase::Transport
                } else {
                    Phase::AwaitRead
                };
                Ok(EngineOp::Done { consumed: 0, produced })
            }
            Phase::Transport => {
                inner.phase = Phase::Transport;
                inner.established_seen = true;
                if src.is_empty() {
                    return Ok(EngineOp::Done { consumed: 0, produced: 0 });
                }
                let take = src.len().min(MAX_PLAIN);
                // Check capacity before encrypting: a stateful cipher must
                // not burn a nonce on a record that gets thrown away.
                let needed = 2 + take + TAG_LEN;
                if dst.len() < needed {
                    return Ok(EngineOp::BufferOverflow { needed });
                }
                let transport = inner.transport.as_mut().expect("transport mode");
                let body_len = match transport.write_message(&src[..take], &mut dst[2..]) {
                    Ok(n) => n,
                    Err(e) => return inner.fail(e.into()),
                };
                dst[..2].copy_from_slice(&(body_len as u16).to_be_bytes());
                Ok(EngineOp::Done { consumed: take, produced: 2 + body_len })
            }
            other => {
                inner.phase = other;
                Err(HandshakeError::BadState)
            }
        }
    }

    fn unwrap(&self, src: &[u8], dst: &mut [u8]) -> Result<EngineOp, HandshakeError> {
        let mut inner = self.lock();
        let Some((body_len, total)) = parse_record(src) else {
            return match inner.phase {
                Phase::AwaitRead | Phase::Transport => Ok(EngineOp::BufferUnderflow),
                _ => Err(HandshakeError::BadState),
            };
        };

        match std::mem::replace(&mut inner.phase, Phase::TaskRunning) {
            Phase::AwaitRead => {
                let body = src[2..total].to_vec();
                match inner.role {
                    Role::Initiator => {
                        // Message 2: processing involves DH work, so stage it
                        // for the delegated task.
                        inner.phase = Phase::TaskPending(Some(body));
                    }
                    Role::Responder => {
                        let hs = match inner.hs.as_mut() {
                            Some(hs) => hs,
                            None => return inner.fail(HandshakeError::BadState),
                        };
                        let mut scratch = vec![0u8; body.len()];
                        if let Err(e) = hs.read_message(&body, &mut scratch) {
                            return inner.fail(e.into());
                        }
                        if inner.hs.as_ref().expect("present").is_handshake_finished() {
                            // Message 3 processed; authenticate and switch.
                            if let Err(e) = inner.establish() {
                                return inner.fail(e);
                            }
                            inner.phase = Phase::Transport;
                        } else {
                            // Message 1 processed; producing message 2 is the
                            // DH-heavy step.
                            inner.phase = Phase::TaskPending(None);
                        }
                    }
                }
                Ok(EngineOp::Done { consumed: total, produced: 0 })
            }
            Phase::Transport => {
                inner.phase = Phase::Transport;
                inner.established_seen = true;
                if dst.len() < body_len {
                    return Ok(EngineOp::BufferOverflow { needed: body_len });
                }
                let transport = inner.transport.as_mut().expect("transport mode");
                let produced = match transport.read_message(&src[2..total], dst) {
                    Ok(n) => n,
                    Err(e) => return inner.fail(e.into()),
                };
                Ok(EngineOp::Done { consumed: total, produced })
            }
            other => {
                inner.phase = other;
                Err(HandshakeError::BadState)
            }
        }
    }

    fn take_task(&self) -> Option<DelegatedTask> {
        let mut inner = self.lock();
        let staged = match std::mem::replace(&mut inner.phase, Phase::TaskRunning) {
            Phase::TaskPending(staged) => staged,
            other => {
                inner.phase = other;
                return None;
            }
        };

        let shared = self.inner.clone();
        Some(Box::new(move || {
            let mut inner = shared.lock().expect("noise engine poisoned");
            let result = (|| {
                match staged {
                    // Initiator: process message 2, then produce message 3
                    // and finish.
                    Some(msg2) => {
                        let hs = inner.hs.as_mut().ok_or(HandshakeError::BadState)?;
                        let mut scratch = vec![0u8; msg2.len()];
                        hs.read_message(&msg2, &mut scratch)?;
                        let mut msg3 = vec![0u8; 256];
                        let len = hs.write_message(&[], &mut msg3)?;
                        msg3.truncate(len);
                        inner.establish()?;
                        inner.phase = Phase::StagedWrite(msg3);
                        Ok(())
                    }
                    // Responder: produce message 2.
                    None => {
                        let hs = inner.hs.as_mut().ok_or(HandshakeError::BadState)?;
                        let mut msg2 = vec![0u8; 256];
                        let len = hs.write_message(&[], &mut msg2)?;
                        msg2.truncate(len);
                        inner.phase = Phase::StagedWrite(msg2);
                        Ok(())
                    }
                }
            })();
            if result.is_err() {
                inner.phase = Phase::Failed;
            }
            result
        }))
    }

    fn session_id(&self) -> Option<[u8; 32]> {
        self.lock().session_id
    }

    fn peer_static_key(&self) -> Option<[u8; 32]> {
        self.lock().peer_key
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
