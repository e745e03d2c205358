//! Integration tests — full session lifecycle, transfer round-trips,
//! and error scenarios over a real TCP connection on localhost.
//!
//! Discovery is exercised at the unit level; these tests wire the two
//! sessions together with a known address so they stay deterministic.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use doclink::{LinkError, Session, SessionConfig, SessionDelegate};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

// ── Helpers ──────────────────────────────────────────────────────

fn config() -> SessionConfig {
    SessionConfig::default()
}

/// Loopback address for a host session's ephemeral port.
fn loopback(session: &Session) -> SocketAddr {
    let port = session.listen_addr().unwrap().port();
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// What a delegate observed, reduced to comparable data.
#[derive(Debug, PartialEq)]
enum Observed {
    Received {
        payload: Bytes,
        type_tag: String,
        name: String,
    },
    Written(u32),
    Disconnected(Option<String>),
    Failed(Option<String>),
    ListenerStopped,
}

/// Delegate that records every callback on a channel.
struct Recorder {
    tx: mpsc::UnboundedSender<Observed>,
}

impl Recorder {
    fn new() -> (Self, mpsc::UnboundedReceiver<Observed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionDelegate for Recorder {
    fn on_file_received(
        &mut self,
        _session: &mut Session,
        payload: Bytes,
        type_tag: String,
        name: String,
    ) {
        let _ = self.tx.send(Observed::Received {
            payload,
            type_tag,
            name,
        });
    }

    fn on_file_written(&mut self, _session: &mut Session, purpose: u32) {
        let _ = self.tx.send(Observed::Written(purpose));
    }

    fn on_peer_disconnected(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self
            .tx
            .send(Observed::Disconnected(error.map(|e| e.to_string())));
    }

    fn on_failed(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self.tx.send(Observed::Failed(error.map(|e| e.to_string())));
    }

    fn on_listener_stopped(&mut self, _session: &mut Session, _error: Option<LinkError>) {
        let _ = self.tx.send(Observed::ListenerStopped);
    }
}

/// Drive `session` until `pred` holds (bounded by a 5s deadline).
async fn drive_until<D, F>(session: &mut Session, delegate: &mut D, pred: F)
where
    D: SessionDelegate,
    F: Fn(&Session) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pred(session) {
        let step = tokio::time::timeout_at(deadline, session.process_next(delegate)).await;
        assert!(step.expect("timed out driving session"), "session closed");
    }
}

/// Wait for the next observation from a session running in a task.
async fn recv_observed(rx: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for delegate callback")
        .expect("delegate channel closed")
}

/// Drive `session` until the recorder observes something.
async fn next_observed<D: SessionDelegate>(
    session: &mut Session,
    delegate: &mut D,
    rx: &mut mpsc::UnboundedReceiver<Observed>,
) -> Observed {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(observed) = rx.try_recv() {
            return observed;
        }
        let step = tokio::time::timeout_at(deadline, session.process_next(delegate)).await;
        assert!(step.expect("timed out driving session"), "session closed");
    }
}

// ── End-to-end document session ──────────────────────────────────

/// Delegate playing the host side of a document session: receive the
/// primary file, answer with a zero-length preview image.
struct HostController {
    tx: mpsc::UnboundedSender<Observed>,
}

impl SessionDelegate for HostController {
    fn on_file_received(
        &mut self,
        session: &mut Session,
        payload: Bytes,
        type_tag: String,
        name: String,
    ) {
        let _ = self.tx.send(Observed::Received {
            payload,
            type_tag,
            name,
        });
        session
            .send_file(Bytes::new(), "png", "/tmp/a.png", 1)
            .unwrap();
    }

    fn on_file_written(&mut self, _session: &mut Session, purpose: u32) {
        let _ = self.tx.send(Observed::Written(purpose));
    }

    fn on_peer_disconnected(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self
            .tx
            .send(Observed::Disconnected(error.map(|e| e.to_string())));
    }

    fn on_failed(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self.tx.send(Observed::Failed(error.map(|e| e.to_string())));
    }
}

/// Delegate playing the client side: once the primary file is sent,
/// read the preview image back, then close.
struct ClientController {
    tx: mpsc::UnboundedSender<Observed>,
}

impl SessionDelegate for ClientController {
    fn on_file_received(
        &mut self,
        session: &mut Session,
        payload: Bytes,
        type_tag: String,
        name: String,
    ) {
        let _ = self.tx.send(Observed::Received {
            payload,
            type_tag,
            name,
        });
        session.close();
    }

    fn on_file_written(&mut self, session: &mut Session, purpose: u32) {
        let _ = self.tx.send(Observed::Written(purpose));
        if purpose == 0 {
            session.read_file(Some(Duration::from_secs(5))).unwrap();
        }
    }

    fn on_peer_disconnected(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self
            .tx
            .send(Observed::Disconnected(error.map(|e| e.to_string())));
    }

    fn on_failed(&mut self, _session: &mut Session, error: Option<LinkError>) {
        let _ = self.tx.send(Observed::Failed(error.map(|e| e.to_string())));
    }
}

#[tokio::test]
async fn test_document_session_round_trip() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let mut client = Session::client_direct(addr, config());

    // Queue the primary file before the connection exists; it must
    // flush automatically once the link is up.
    let payload = Bytes::from(vec![0x5a; 1024]);
    assert_ok!(client.send_file(payload.clone(), "pkdrawing", "/tmp/a.pkdrawing", 0));

    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();

    let host_task = tokio::spawn(async move {
        let mut controller = HostController { tx: host_tx };
        host.run(&mut controller).await;
    });
    let client_task = tokio::spawn(async move {
        let mut controller = ClientController { tx: client_tx };
        client.run(&mut controller).await;
    });

    // Host sees the identical 1024 bytes, type, and name.
    assert_eq!(
        recv_observed(&mut host_rx).await,
        Observed::Received {
            payload,
            type_tag: "pkdrawing".into(),
            name: "/tmp/a.pkdrawing".into(),
        }
    );

    // Client learns its send completed, then reads the preview.
    assert_eq!(recv_observed(&mut client_rx).await, Observed::Written(0));
    assert_eq!(
        recv_observed(&mut client_rx).await,
        Observed::Received {
            payload: Bytes::new(),
            type_tag: "png".into(),
            name: "/tmp/a.png".into(),
        }
    );

    // Host's zero-length send completed without a payload stage.
    assert_eq!(recv_observed(&mut host_rx).await, Observed::Written(1));

    // Client closed itself from inside the callback.
    tokio::time::timeout(Duration::from_secs(5), client_task)
        .await
        .expect("client loop did not stop")
        .unwrap();
    host_task.abort();
}

// ── Connection management ────────────────────────────────────────

#[tokio::test]
async fn test_second_inbound_connection_rejected() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    let mut first = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    // A second connection attempt is accepted and dropped at once.
    let mut second = TcpStream::connect(addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), host.process_next(&mut recorder))
        .await
        .expect("timed out waiting for the second accept");

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("rejected stream was not closed")
        .unwrap();
    assert_eq!(n, 0);

    // The existing connection is untouched: a frame still arrives.
    first.write_all(b"3\n\ntxt\n\n/tmp/x\n\nabc").await.unwrap();
    let got = next_observed(&mut host, &mut recorder, &mut observed).await;
    assert_eq!(
        got,
        Observed::Received {
            payload: Bytes::from_static(b"abc"),
            type_tag: "txt".into(),
            name: "/tmp/x".into(),
        }
    );
}

#[tokio::test]
async fn test_disconnect_mid_transfer_clears_in_flight_state() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    // Both directions become busy: the accept armed a receive, and we
    // queue a send on top.
    assert!(host.is_receiving());
    assert_ok!(host.send_file(Bytes::from_static(b"out"), "txt", "/tmp/out", 0));
    assert!(matches!(host.read_file(None), Err(LinkError::Busy)));
    assert!(matches!(
        host.send_file(Bytes::new(), "png", "/tmp/p", 1),
        Err(LinkError::Busy)
    ));

    // Start a transfer but break the connection before the payload.
    raw.write_all(b"10\n\nbin\n\n/tmp/x\n\nab").await.unwrap();
    drop(raw);

    loop {
        match next_observed(&mut host, &mut recorder, &mut observed).await {
            Observed::Disconnected(_) => break,
            Observed::Written(_) => continue, // the queued send may finish first
            other => panic!("unexpected observation {other:?}"),
        }
    }

    // In-flight state is gone; both directions accept new work.
    assert!(!host.is_connected());
    assert!(!host.is_receiving());
    assert_ok!(host.read_file(None));
    assert_ok!(host.send_file(Bytes::from_static(b"again"), "txt", "/tmp/y", 0));
}

#[tokio::test]
async fn test_receive_stage_timeout_drops_peer() {
    let mut cfg = config();
    cfg.receive_timeout = Duration::from_millis(100);
    let mut host = Session::host_unadvertised(cfg).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    // Connect and then stay silent: the armed receive must expire.
    let _raw = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    match next_observed(&mut host, &mut recorder, &mut observed).await {
        Observed::Disconnected(Some(msg)) => assert!(msg.contains("timed out")),
        other => panic!("expected timeout disconnect, got {other:?}"),
    }
    assert!(!host.is_connected());
}

#[tokio::test]
async fn test_malformed_size_reports_failure_but_keeps_link() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    raw.write_all(b"not-a-number\n\n").await.unwrap();
    match next_observed(&mut host, &mut recorder, &mut observed).await {
        Observed::Failed(Some(msg)) => assert!(msg.contains("malformed")),
        other => panic!("expected failure, got {other:?}"),
    }

    // The connection survives a protocol error.
    assert!(host.is_connected());

    // A fresh read on the same link works once the peer behaves.
    assert_ok!(host.read_file(None));
    raw.write_all(b"2\n\ntxt\n\n/tmp/z\n\nok").await.unwrap();
    assert_eq!(
        next_observed(&mut host, &mut recorder, &mut observed).await,
        Observed::Received {
            payload: Bytes::from_static(b"ok"),
            type_tag: "txt".into(),
            name: "/tmp/z".into(),
        }
    );
}

#[tokio::test]
async fn test_flooding_peer_is_dropped_at_buffer_cap() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    // Delimiter-free bytes make no decode progress, so they can only
    // accumulate; past one frame's worth the session must cut the
    // peer off rather than buffer without bound.
    let writer = tokio::spawn(async move {
        let chunk = vec![b'x'; 64 * 1024];
        while raw.write_all(&chunk).await.is_ok() {}
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        if let Ok(event) = observed.try_recv() {
            match event {
                Observed::Disconnected(Some(msg)) => {
                    assert!(msg.contains("too large"));
                    break;
                }
                other => panic!("expected overflow disconnect, got {other:?}"),
            }
        }
        let step = tokio::time::timeout_at(deadline, host.process_next(&mut recorder)).await;
        assert!(step.expect("flood was never cut off"), "session closed");
    }

    assert!(!host.is_connected());
    writer.abort();
}

#[tokio::test]
async fn test_resend_after_disconnect_completes() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    // First attempt: the transfer starts but the peer drops before the
    // payload arrives.
    let mut raw = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;
    raw.write_all(b"4\n\npkdrawing\n\n/tmp/a.pkdrawing\n\nda")
        .await
        .unwrap();
    drop(raw);
    loop {
        match next_observed(&mut host, &mut recorder, &mut observed).await {
            Observed::Disconnected(_) => break,
            other => panic!("unexpected observation {other:?}"),
        }
    }
    assert!(!host.is_receiving());

    // Second attempt: a fresh session resends the same file and the
    // host sees it whole.
    let mut client = Session::client_direct(addr, config());
    assert_ok!(client.send_file(
        Bytes::from_static(b"data"),
        "pkdrawing",
        "/tmp/a.pkdrawing",
        0
    ));
    let (client_delegate, _client_observed) = Recorder::new();
    let client_task = tokio::spawn(async move {
        let mut delegate = client_delegate;
        client.run(&mut delegate).await;
    });

    assert_eq!(
        next_observed(&mut host, &mut recorder, &mut observed).await,
        Observed::Received {
            payload: Bytes::from_static(b"data"),
            type_tag: "pkdrawing".into(),
            name: "/tmp/a.pkdrawing".into(),
        }
    );
    client_task.abort();
}

#[tokio::test]
async fn test_explicit_disconnect_keeps_listener_alive() {
    let mut host = Session::host_unadvertised(config()).await.unwrap();
    let addr = loopback(&host);
    let (mut recorder, mut observed) = Recorder::new();

    let _first = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;

    host.disconnect();
    assert_eq!(
        next_observed(&mut host, &mut recorder, &mut observed).await,
        Observed::Disconnected(None)
    );
    assert!(!host.is_connected());
    assert!(host.lifecycle().is_active());

    // The listening path is still up: a new peer can connect.
    let _second = TcpStream::connect(addr).await.unwrap();
    drive_until(&mut host, &mut recorder, Session::is_connected).await;
}
