//! Session lifecycle and ordered delivery over plaintext TCP.

use crate::*;

use std::sync::Arc;

use bytes::Bytes;
use talus_engine::{SessionState, StateEvent};

/// Frames queued on one session arrive in queueing order, byte for byte.
#[tokio::test(flavor = "multi_thread")]
async fn frames_arrive_in_fifo_order() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    for payload in [&b"alpha"[..], b"bravo", b"charlie"] {
        client.send(&Bytes::from_static(payload)).unwrap();
    }

    wait_until("three frames delivered", || recorder.message_count() == 3).await;
    assert_eq!(
        recorder.messages(),
        vec![
            Bytes::from_static(b"alpha"),
            Bytes::from_static(b"bravo"),
            Bytes::from_static(b"charlie"),
        ]
    );
}

/// Round trip through an echoing peer preserves payload bytes exactly.
#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip_is_byte_exact() {
    let server = start_server(ServerOptions::new(Arc::new(Echo))).await;
    let recorder = Arc::new(Recorder::default());
    let client = connect_client(server.addr, recorder.clone(), None).await;

    let payload: Bytes =
        (0..10_000u32).flat_map(|i| i.to_be_bytes()).collect::<Vec<u8>>().into();
    client.send(&payload).unwrap();

    wait_until("echo received", || recorder.message_count() == 1).await;
    assert_eq!(recorder.messages()[0], payload);
}

/// A graceful close flushes everything already queued before the channel
/// goes down, and the closing side sees SessionClosing then SessionClosed.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_delivers_queued_frames() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client_recorder = Arc::new(Recorder::default());
    let client = connect_client(server.addr, client_recorder.clone(), None).await;

    for i in 0..50u8 {
        client.send(&Bytes::from(vec![i; 100])).unwrap();
    }
    client.close(false);

    wait_until("all frames delivered", || recorder.message_count() == 50).await;
    wait_until("client closed", || client.state() == SessionState::Closed).await;

    let events = client_recorder.events();
    let closing = events.iter().position(|e| *e == StateEvent::SessionClosing);
    let closed = events.iter().position(|e| *e == StateEvent::SessionClosed);
    assert!(closing.unwrap() < closed.unwrap(), "closing must precede closed: {events:?}");
    assert_eq!(
        events.iter().filter(|e| **e == StateEvent::SessionClosed).count(),
        1,
        "SessionClosed must fire exactly once"
    );
}

/// An immediate close tears the session down without waiting and rejects
/// further writes.
#[tokio::test(flavor = "multi_thread")]
async fn immediate_close_rejects_further_writes() {
    let server = start_server(ServerOptions::new(Arc::new(Recorder::default()))).await;
    let recorder = Arc::new(Recorder::default());
    let client = connect_client(server.addr, recorder.clone(), None).await;

    client.close(true);
    wait_until("client closed", || client.state() == SessionState::Closed).await;

    assert!(matches!(
        client.send(&Bytes::from_static(b"late")),
        Err(talus_engine::EngineError::Closed)
    ));
    assert_eq!(
        recorder.events().iter().filter(|e| **e == StateEvent::SessionClosed).count(),
        1
    );
    let _ = server;
}

/// An immediate close discards still-queued frames instead of flushing
/// them, and the state transition lands before `close` returns. Runs on a
/// current-thread runtime with no await between the sends and the close, so
/// the queued frames cannot have started draining yet.
#[tokio::test]
async fn immediate_close_discards_queued_frames() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    for i in 0..20u8 {
        client.send(&Bytes::from(vec![i; 64])).unwrap();
    }
    client.close(true);

    assert_eq!(
        client.state(),
        SessionState::Closed,
        "close(true) must reach CLOSED before returning"
    );
    assert!(matches!(
        client.send(&Bytes::from_static(b"late")),
        Err(talus_engine::EngineError::Closed)
    ));

    wait_until("server session closed", || recorder.has_event(StateEvent::SessionClosed)).await;
    assert_eq!(recorder.message_count(), 0, "discarded frames must never reach the peer");
}

/// The peer's EOF surfaces as InputShutdown and drains into a close; the
/// server's session table empties out.
#[tokio::test(flavor = "multi_thread")]
async fn peer_eof_closes_server_session() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    wait_until("session registered", || !server.sessions.is_empty()).await;
    client.close(true);

    wait_until("input shutdown observed", || recorder.has_event(StateEvent::InputShutdown)).await;
    wait_until("server session closed", || recorder.has_event(StateEvent::SessionClosed)).await;
    wait_until("session table empty", || server.sessions.is_empty()).await;
}

/// Server shutdown closes every live session.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_signal_closes_live_sessions() {
    let server = start_server(ServerOptions::new(Arc::new(Recorder::default()))).await;
    let recorder = Arc::new(Recorder::default());
    let client = connect_client(server.addr, recorder.clone(), None).await;

    wait_until("session registered", || !server.sessions.is_empty()).await;
    server.shutdown.send(()).unwrap();

    wait_until("client observed close", || client.state() == SessionState::Closed).await;
}

/// NewSession fires on both endpoints when the session opens.
#[tokio::test(flavor = "multi_thread")]
async fn new_session_event_fires_on_both_ends() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client_recorder = Arc::new(Recorder::default());
    let _client = connect_client(server.addr, client_recorder.clone(), None).await;

    wait_until("server saw new session", || recorder.has_event(StateEvent::NewSession)).await;
    assert!(client_recorder.has_event(StateEvent::NewSession));
}
