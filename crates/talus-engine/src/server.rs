//! Accepting endpoint: owns the listener, the shared buffer pool, and the
//! table of live sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use talus_core::pool::BufferPool;
use talus_core::protocol::Protocol;
use talus_core::EngineConfig;

use crate::error::EngineError;
use crate::interfaces::{Filter, MessageProcessor, NetMonitor, SessionId, StateEvent};
use crate::secure::{Role, SecurityConfig};
use crate::session::{read_loop, Hooks, Session};
use crate::transport::establish;

/// Live sessions, keyed by session id.
pub type SessionTable<T> = Arc<DashMap<SessionId, Arc<Session<T>>>>;

pub struct SocketServer<T: Send + 'static> {
    listener: TcpListener,
    config: Arc<EngineConfig>,
    pool: Arc<BufferPool>,
    hooks: Hooks<T>,
    security: Option<Arc<SecurityConfig>>,
    sessions: SessionTable<T>,
    shutdown: broadcast::Receiver<()>,
}

impl<T: Send + 'static> SocketServer<T> {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: EngineConfig,
        protocol: Arc<dyn Protocol<Msg = T>>,
        processor: Arc<dyn MessageProcessor<T>>,
        filters: Vec<Arc<dyn Filter<T>>>,
        monitor: Option<Arc<dyn NetMonitor>>,
        security: Option<SecurityConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(addr).await?;
        let pool = Arc::new(BufferPool::new(config.pool.to_pool_config())?);
        Ok(Self {
            listener,
            config: Arc::new(config),
            pool,
            hooks: Hooks { protocol, processor, filters, monitor },
            security: security.map(Arc::new),
            sessions: Arc::new(DashMap::new()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> SessionTable<T> {
        self.sessions.clone()
    }

    /// Accept loop. Runs until the shutdown signal, then closes every live
    /// session immediately.
    pub async fn run(mut self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, secure = self.security.is_some(), "listening");
        }
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        let err = EngineError::Io(e);
                        self.hooks.processor.state_event(
                            None,
                            StateEvent::AcceptException,
                            Some(&err),
                        );
                    }
                },
            }
        }
        for entry in self.sessions.iter() {
            entry.value().close(true);
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Some(monitor) = &self.hooks.monitor {
            if !monitor.should_accept(&stream) {
                debug!(%peer, "inbound connection vetoed");
                self.hooks.processor.state_event(None, StateEvent::RejectAccept, None);
                return;
            }
        }

        let config = self.config.clone();
        let pool = self.pool.clone();
        let hooks = self.hooks.clone();
        let security = self.security.clone();
        let sessions = self.sessions.clone();

        tokio::spawn(async move {
            let parts = establish(stream, Role::Responder, security.as_deref()).await;
            let (read, write, secure_id) = match parts {
                Ok(parts) => parts,
                Err(e) => {
                    let err = EngineError::Handshake(e);
                    warn!(%peer, error = %err, "inbound handshake failed");
                    hooks.processor.state_event(None, StateEvent::AcceptException, Some(&err));
                    return;
                }
            };

            let session = Session::new(peer, secure_id, pool, config, hooks, write);
            sessions.insert(session.id(), session.clone());
            session.open();
            read_loop(session.clone(), read).await;
            session.closed().await;
            sessions.remove(&session.id());
        });
    }
}
