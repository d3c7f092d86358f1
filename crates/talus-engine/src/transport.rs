//! Transport halves: plain TCP or the secure channel, behind one surface so
//! the session machinery never branches on security.

use std::io::{self, IoSlice};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::secure::{
    HandshakeContext, HandshakeEngine, HandshakeError, NoiseEngine, Role, SecureReader,
    SecureWriter, SecurityConfig,
};

pub(crate) enum ReadTransport {
    Plain(OwnedReadHalf),
    Secure(SecureReader),
}

impl ReadTransport {
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(half) => half.read(buf).await,
            Self::Secure(reader) => reader.read(buf).await,
        }
    }
}

pub(crate) enum WriteTransport {
    Plain(OwnedWriteHalf),
    Secure(SecureWriter),
}

impl WriteTransport {
    pub(crate) async fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Self::Plain(half) => half.write_vectored(bufs).await,
            Self::Secure(writer) => writer.write_vectored(bufs).await,
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(half) => half.shutdown().await,
            Self::Secure(writer) => writer.shutdown().await,
        }
    }
}

/// Turn a fresh TCP stream into transport halves, running the Noise
/// handshake first when security is configured. A handshake failure aborts
/// the connection; there is no plaintext fallback.
pub(crate) async fn establish(
    mut stream: TcpStream,
    role: Role,
    security: Option<&SecurityConfig>,
) -> Result<(ReadTransport, WriteTransport, Option<[u8; 32]>), HandshakeError> {
    let Some(security) = security else {
        let (read, write) = stream.into_split();
        return Ok((ReadTransport::Plain(read), WriteTransport::Plain(write), None));
    };

    let engine: Arc<dyn HandshakeEngine> = Arc::new(NoiseEngine::new(
        &security.keypair,
        role,
        security.trusted_peers.clone(),
    )?);
    let mut context = HandshakeContext::new(engine);
    context.drive(&mut stream).await?;
    let (engine, leftover) = context.into_parts();
    let secure_id = engine.session_id();
    debug!(
        session_id = secure_id.map(hex::encode).unwrap_or_default(),
        "secure channel established"
    );

    let (read, write) = stream.into_split();
    Ok((
        ReadTransport::Secure(SecureReader::new(read, engine.clone(), leftover)),
        WriteTransport::Secure(SecureWriter::new(write, engine)),
        secure_id,
    ))
}
