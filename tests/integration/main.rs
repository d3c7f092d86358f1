//! talus integration test harness.
//!
//! Tests run real TCP connections over loopback: an engine server and engine
//! clients exchange length-prefixed frames end to end, plaintext or through
//! the Noise secure layer. Each test binds its own ephemeral port, so tests
//! run in parallel without interfering.

mod failures;
mod flow;
mod secure;
mod sessions;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use talus_core::{EngineConfig, LengthPrefixed, PoolSettings, Protocol};
use talus_engine::{
    connect, Filter, MessageProcessor, NetMonitor, SecurityConfig, Session, SessionTable,
    SocketServer, StateEvent,
};

// ── Processors ────────────────────────────────────────────────────────────────

/// Records everything an endpoint observes, in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<Bytes>>,
    pub events: Mutex<Vec<StateEvent>>,
    /// Payload that makes `process` fail, for exercising the non-fatal
    /// process-error path.
    pub poison: Option<Bytes>,
}

impl Recorder {
    pub fn poisoned(payload: &'static [u8]) -> Self {
        Self { poison: Some(Bytes::from_static(payload)), ..Default::default() }
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.messages.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_event(&self, event: StateEvent) -> bool {
        self.events.lock().unwrap().contains(&event)
    }
}

impl MessageProcessor<Bytes> for Recorder {
    fn process(&self, _session: &Arc<Session<Bytes>>, msg: &Bytes) -> anyhow::Result<()> {
        if self.poison.as_ref() == Some(msg) {
            anyhow::bail!("poisoned payload");
        }
        self.messages.lock().unwrap().push(msg.clone());
        Ok(())
    }

    fn state_event(
        &self,
        _session: Option<&Arc<Session<Bytes>>>,
        event: StateEvent,
        _error: Option<&talus_engine::EngineError>,
    ) {
        self.events.lock().unwrap().push(event);
    }
}

/// Sends every received message straight back.
pub struct Echo;

impl MessageProcessor<Bytes> for Echo {
    fn process(&self, session: &Arc<Session<Bytes>>, msg: &Bytes) -> anyhow::Result<()> {
        session.send(msg)?;
        Ok(())
    }
}

// ── Server harness ────────────────────────────────────────────────────────────

/// Small pool so tests exercise real allocation without reserving megabytes.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        pool: PoolSettings { page_size: 16 * 1024, page_count: 8, ..Default::default() },
        ..Default::default()
    }
}

pub struct ServerOptions {
    pub config: EngineConfig,
    pub processor: Arc<dyn MessageProcessor<Bytes>>,
    pub filters: Vec<Arc<dyn Filter<Bytes>>>,
    pub monitor: Option<Arc<dyn NetMonitor>>,
    pub security: Option<SecurityConfig>,
}

impl ServerOptions {
    pub fn new(processor: Arc<dyn MessageProcessor<Bytes>>) -> Self {
        Self {
            config: test_config(),
            processor,
            filters: Vec::new(),
            monitor: None,
            security: None,
        }
    }
}

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub sessions: SessionTable<Bytes>,
    pub shutdown: broadcast::Sender<()>,
}

pub async fn start_server(opts: ServerOptions) -> TestServer {
    let (shutdown, rx) = broadcast::channel(1);
    let protocol: Arc<dyn Protocol<Msg = Bytes>> = Arc::new(LengthPrefixed::default());
    let server = SocketServer::bind(
        "127.0.0.1:0",
        opts.config,
        protocol,
        opts.processor,
        opts.filters,
        opts.monitor,
        opts.security,
        rx,
    )
    .await
    .expect("server bind");
    let addr = server.local_addr().expect("local addr");
    let sessions = server.sessions();
    tokio::spawn(server.run());
    TestServer { addr, sessions, shutdown }
}

pub async fn connect_client(
    addr: std::net::SocketAddr,
    processor: Arc<dyn MessageProcessor<Bytes>>,
    security: Option<SecurityConfig>,
) -> Arc<Session<Bytes>> {
    try_connect(addr, processor, security).await.expect("client connect")
}

pub async fn try_connect(
    addr: std::net::SocketAddr,
    processor: Arc<dyn MessageProcessor<Bytes>>,
    security: Option<SecurityConfig>,
) -> Result<Arc<Session<Bytes>>, talus_engine::EngineError> {
    let protocol: Arc<dyn Protocol<Msg = Bytes>> = Arc::new(LengthPrefixed::default());
    connect(addr, test_config(), protocol, processor, Vec::new(), None, security).await
}

// ── Waiting ───────────────────────────────────────────────────────────────────

/// Poll until `cond` holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
