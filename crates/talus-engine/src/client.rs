//! Connecting endpoint. Mirrors the accepting side: same session machinery,
//! initiator role in the handshake.

use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use talus_core::pool::BufferPool;
use talus_core::protocol::Protocol;
use talus_core::EngineConfig;

use crate::error::EngineError;
use crate::interfaces::{Filter, MessageProcessor, NetMonitor};
use crate::secure::{Role, SecurityConfig};
use crate::session::{read_loop, Hooks, Session};
use crate::transport::establish;

/// Connect to a remote endpoint and return the established session. With
/// security configured the handshake completes before this returns; an
/// untrusted peer is an error, never a plaintext connection.
#[allow(clippy::too_many_arguments)]
pub async fn connect<T: Send + 'static>(
    addr: impl ToSocketAddrs,
    config: EngineConfig,
    protocol: Arc<dyn Protocol<Msg = T>>,
    processor: Arc<dyn MessageProcessor<T>>,
    filters: Vec<Arc<dyn Filter<T>>>,
    monitor: Option<Arc<dyn NetMonitor>>,
    security: Option<SecurityConfig>,
) -> Result<Arc<Session<T>>, EngineError> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    let (read, write, secure_id) = establish(stream, Role::Initiator, security.as_ref()).await?;

    let pool = Arc::new(BufferPool::new(config.pool.to_pool_config())?);
    let hooks = Hooks { protocol, processor, filters, monitor };
    let session = Session::new(peer, secure_id, pool, Arc::new(config), hooks, write);
    debug!(session = session.id(), %peer, "outbound session established");
    session.open();

    tokio::spawn(read_loop(session.clone(), read));
    Ok(session)
}
