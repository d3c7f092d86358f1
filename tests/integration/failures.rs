//! Failure routing: non-fatal process errors, fatal decode errors, filter
//! vetoes, and the accept-time monitor veto.

use crate::*;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use talus_engine::{EngineError, Filter, NetMonitor, Session, SessionState, StateEvent};

/// A processor failure is reported and the session keeps running: the next
/// frame still arrives.
#[tokio::test(flavor = "multi_thread")]
async fn process_error_keeps_session_open() {
    let recorder = Arc::new(Recorder::poisoned(b"bad"));
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    client.send(&Bytes::from_static(b"first")).unwrap();
    client.send(&Bytes::from_static(b"bad")).unwrap();
    client.send(&Bytes::from_static(b"second")).unwrap();

    wait_until("frames after the failure delivered", || recorder.message_count() == 2).await;
    assert_eq!(
        recorder.messages(),
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
    assert!(recorder.has_event(StateEvent::ProcessException));
    assert!(
        !recorder.has_event(StateEvent::SessionClosed),
        "a process error must not close the session"
    );
}

/// A frame the protocol rejects is fatal: DecodeException fires, then the
/// session closes, and nothing gets dispatched.
#[tokio::test(flavor = "multi_thread")]
async fn decode_error_closes_session() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions::new(recorder.clone())).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    // Header declaring a frame far beyond the codec's limit.
    client.write(Bytes::copy_from_slice(&(10u32 * 1024 * 1024).to_be_bytes())).unwrap();

    wait_until("decode failure reported", || recorder.has_event(StateEvent::DecodeException))
        .await;
    wait_until("session closed", || recorder.has_event(StateEvent::SessionClosed)).await;

    let events = recorder.events();
    let decode = events.iter().position(|e| *e == StateEvent::DecodeException).unwrap();
    let closed = events.iter().position(|e| *e == StateEvent::SessionClosed).unwrap();
    assert!(decode < closed, "exception must precede the close: {events:?}");
    assert_eq!(recorder.message_count(), 0);

    // The fatal close propagates to the peer as a dropped connection.
    wait_until("client observed close", || client.state() == SessionState::Closed).await;
}

/// Counts pipeline traffic and vetoes one payload.
#[derive(Default)]
struct VetoFilter {
    reads: Mutex<usize>,
    writes: Mutex<usize>,
    vetoed: Mutex<usize>,
}

impl Filter<Bytes> for VetoFilter {
    fn read_filter(&self, _session: &Arc<Session<Bytes>>, size: usize) {
        assert!(size > 0);
        *self.reads.lock().unwrap() += 1;
    }

    fn write_filter(&self, _session: &Arc<Session<Bytes>>, size: usize) {
        assert!(size > 0);
        *self.writes.lock().unwrap() += 1;
    }

    fn process_filter(&self, _session: &Arc<Session<Bytes>>, msg: &Bytes) -> bool {
        if msg.as_ref() == b"skip" {
            *self.vetoed.lock().unwrap() += 1;
            return false;
        }
        true
    }
}

/// A filter veto swallows the message without error; surrounding frames
/// flow through and the read filter still observed the vetoed bytes.
#[tokio::test(flavor = "multi_thread")]
async fn filter_veto_swallows_message() {
    let recorder = Arc::new(Recorder::default());
    let filter = Arc::new(VetoFilter::default());
    let server = start_server(ServerOptions {
        filters: vec![filter.clone()],
        ..ServerOptions::new(recorder.clone())
    })
    .await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    client.send(&Bytes::from_static(b"keep-1")).unwrap();
    client.send(&Bytes::from_static(b"skip")).unwrap();
    client.send(&Bytes::from_static(b"keep-2")).unwrap();

    wait_until("surviving frames delivered", || recorder.message_count() == 2).await;
    assert_eq!(
        recorder.messages(),
        vec![Bytes::from_static(b"keep-1"), Bytes::from_static(b"keep-2")]
    );
    assert_eq!(*filter.vetoed.lock().unwrap(), 1);
    assert_eq!(*filter.reads.lock().unwrap(), 3, "read filter sees vetoed frames too");
    assert!(!recorder.has_event(StateEvent::ProcessException));
}

/// Vetoes every inbound connection.
struct RejectAll;

impl NetMonitor for RejectAll {
    fn should_accept(&self, _channel: &tokio::net::TcpStream) -> bool {
        false
    }
}

/// A monitor veto drops the connection before any session or handshake
/// work happens.
#[tokio::test(flavor = "multi_thread")]
async fn monitor_veto_rejects_connection() {
    let recorder = Arc::new(Recorder::default());
    let server = start_server(ServerOptions {
        monitor: Some(Arc::new(RejectAll)),
        ..ServerOptions::new(recorder.clone())
    })
    .await;

    // The TCP connect itself lands in the accept queue, so it succeeds;
    // the engine drops it immediately after.
    let _ = tokio::net::TcpStream::connect(server.addr).await.unwrap();

    wait_until("veto reported", || recorder.has_event(StateEvent::RejectAccept)).await;
    assert!(server.sessions.is_empty());
    assert!(!recorder.has_event(StateEvent::NewSession));
}

/// Writes queued behind a close-in-progress are refused rather than
/// silently dropped.
#[tokio::test(flavor = "multi_thread")]
async fn write_after_graceful_close_is_refused() {
    let server = start_server(ServerOptions::new(Arc::new(Recorder::default()))).await;
    let client = connect_client(server.addr, Arc::new(Recorder::default()), None).await;

    client.close(false);
    assert!(matches!(
        client.send(&Bytes::from_static(b"too late")),
        Err(EngineError::Closed)
    ));
}
