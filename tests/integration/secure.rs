//! The Noise secure layer end to end: encrypted sessions behave exactly like
//! plaintext ones above the transport, and an untrusted peer never gets a
//! session at all.

use crate::*;

use std::sync::Arc;

use bytes::Bytes;
use talus_engine::{Keypair, SecurityConfig, StateEvent};

fn keys() -> (Keypair, Keypair) {
    (Keypair::generate(), Keypair::generate())
}

/// Encrypted echo round trip is byte-exact and both ends derive the same
/// secure session id.
#[tokio::test(flavor = "multi_thread")]
async fn encrypted_echo_round_trip() {
    let (server_key, client_key) = keys();
    let server = start_server(ServerOptions {
        security: Some(SecurityConfig::new(server_key)),
        ..ServerOptions::new(Arc::new(Echo))
    })
    .await;

    let recorder = Arc::new(Recorder::default());
    let client = connect_client(
        server.addr,
        recorder.clone(),
        Some(SecurityConfig::new(client_key)),
    )
    .await;

    let payload: Bytes = (0..30_000u32).map(|i| (i % 256) as u8).collect::<Vec<u8>>().into();
    client.send(&payload).unwrap();

    wait_until("echo received", || recorder.message_count() == 1).await;
    assert_eq!(recorder.messages()[0], payload);

    let client_sid = client.secure_session_id().expect("client session id");
    wait_until("server session registered", || !server.sessions.is_empty()).await;
    let server_sid = server
        .sessions
        .iter()
        .next()
        .unwrap()
        .value()
        .secure_session_id()
        .expect("server session id");
    assert_eq!(client_sid, server_sid, "both peers must derive the same identity");
}

/// Mutual trust pinning: both sides list the other's static key and the
/// session establishes.
#[tokio::test(flavor = "multi_thread")]
async fn pinned_peers_establish() {
    let (server_key, client_key) = keys();
    let server_pub = server_key.public;
    let client_pub = client_key.public;

    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions {
        security: Some(SecurityConfig::with_trusted_peers(server_key, vec![client_pub])),
        ..ServerOptions::new(recorder.clone())
    })
    .await;

    let client = connect_client(
        server.addr,
        Arc::new(Recorder::default()),
        Some(SecurityConfig::with_trusted_peers(client_key, vec![server_pub])),
    )
    .await;

    client.send(&Bytes::from_static(b"hello over noise")).unwrap();
    wait_until("frame delivered", || recorder.message_count() == 1).await;
}

/// A client the server does not trust is rejected while the server
/// processes the final handshake message: the server never creates a
/// session and drops the connection. There is no plaintext fallback path.
#[tokio::test(flavor = "multi_thread")]
async fn untrusted_client_is_rejected() {
    let (server_key, client_key) = keys();
    let stranger = Keypair::generate().public;

    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions {
        security: Some(SecurityConfig::with_trusted_peers(server_key, vec![stranger])),
        ..ServerOptions::new(recorder.clone())
    })
    .await;

    // The initiator finishes its side of the XX pattern after sending the
    // last message, so the connect itself may succeed; rejection shows up
    // as the server refusing the session and dropping the connection.
    let result = try_connect(
        server.addr,
        Arc::new(Recorder::default()),
        Some(SecurityConfig::new(client_key)),
    )
    .await;

    wait_until("accept failure reported", || {
        recorder.has_event(StateEvent::AcceptException)
    })
    .await;
    assert!(server.sessions.is_empty(), "no session may exist for a rejected peer");
    assert!(!recorder.has_event(StateEvent::NewSession));

    if let Ok(session) = result {
        session.closed().await;
    }
}

/// A server whose key the client does not trust fails the connect.
#[tokio::test(flavor = "multi_thread")]
async fn untrusted_server_is_rejected() {
    let (server_key, client_key) = keys();
    let stranger = Keypair::generate().public;

    let server = start_server(ServerOptions {
        security: Some(SecurityConfig::new(server_key)),
        ..ServerOptions::new(Arc::new(Recorder::default()))
    })
    .await;

    let result = try_connect(
        server.addr,
        Arc::new(Recorder::default()),
        Some(SecurityConfig::with_trusted_peers(client_key, vec![stranger])),
    )
    .await;
    assert!(matches!(result, Err(talus_engine::EngineError::Handshake(_))));
}

/// A plaintext client talking to a secure server never reaches OPEN: the
/// handshake fails instead of silently downgrading.
#[tokio::test(flavor = "multi_thread")]
async fn plaintext_client_cannot_reach_secure_server() {
    let (server_key, _) = keys();
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions {
        security: Some(SecurityConfig::new(server_key)),
        ..ServerOptions::new(recorder.clone())
    })
    .await;

    // Engine client without security: frames go out unencrypted and the
    // responder's record parser rejects them.
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;
    client.send(&Bytes::from(vec![0xAAu8; 4096])).unwrap();

    wait_until("handshake failure reported", || {
        recorder.has_event(StateEvent::AcceptException)
    })
    .await;
    assert!(!recorder.has_event(StateEvent::NewSession));
    assert_eq!(recorder.message_count(), 0);
}
