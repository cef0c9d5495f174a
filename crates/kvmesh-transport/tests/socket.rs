//! Socket transport against a real relay bound to an ephemeral port.

use kvmesh_core::{ConnectionState, KvmeshError, MessageType, PeerId, SyncMessage};
use kvmesh_relay::{serve, RelayState};
use kvmesh_transport::{SocketOptions, SocketTransport, Transport, TransportEvent};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::WebSocketStream;

async fn start_relay_on(listener: TcpListener) -> SocketAddr {
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, RelayState::new(64)));
    addr
}

async fn start_relay() -> SocketAddr {
    start_relay_on(TcpListener::bind("127.0.0.1:0").await.unwrap()).await
}

/// An address nothing is listening on.
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Accept one websocket session by hand, standing in for the relay.
async fn accept_session(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    })
    .await
    .expect("transport never dialed")
}

fn options(addr: SocketAddr, room: &str) -> SocketOptions {
    SocketOptions {
        room: Some(room.to_string()),
        heartbeat_interval: Duration::from_secs(30),
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        ..SocketOptions::new(format!("ws://{addr}/ws"))
    }
}

fn messages(t: &SocketTransport) -> mpsc::UnboundedReceiver<SyncMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    t.on_message(Arc::new(move |m| {
        let _ = tx.send(m);
    })).detach();
    rx
}

fn events(t: &SocketTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    t.on_event(Arc::new(move |e| {
        let _ = tx.send(e);
    })).detach();
    rx
}

async fn wait_for<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    within: Duration,
    mut pred: impl FnMut(&T) -> bool,
) -> Option<T> {
    tokio::time::timeout(within, async {
        while let Some(item) = rx.recv().await {
            if pred(&item) {
                return Some(item);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

fn state(source: &str, n: u64) -> SyncMessage {
    SyncMessage::new(
        format!("{source}-{n}"),
        MessageType::State,
        PeerId::from(source),
        json!({ "key": "k", "value": n, "previous": null }),
        n,
    )
}

#[tokio::test]
async fn test_exchange_through_relay() {
    let addr = start_relay().await;
    let a = SocketTransport::new(PeerId::from("a"), options(addr, "room"));
    let b = SocketTransport::new(PeerId::from("b"), options(addr, "room"));
    let mut a_rx = messages(&a);
    let mut b_rx = messages(&b);

    assert_ok!(a.connect().await);
    assert_ok!(b.connect().await);
    assert!(a.is_connected());
    // connecting again is a no-op
    assert_ok!(a.connect().await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    for n in 1..=3 {
        assert_ok!(a.send(&state("a", n)).await);
    }
    for n in 1..=3 {
        let got = wait_for(&mut b_rx, Duration::from_secs(2), |_| true).await.unwrap();
        assert_eq!(got.version, n);
    }
    let echoed = wait_for(&mut a_rx, Duration::from_millis(100), |_| true).await;
    assert!(echoed.is_none(), "relay echoed a's frame back");

    assert_ok!(a.disconnect().await);
    assert_eq!(a.state(), ConnectionState::Disconnected);
    assert!(matches!(a.send(&state("a", 4)).await, Err(KvmeshError::NotConnected)));
}

#[tokio::test]
async fn test_heartbeat_reports_latency() {
    let addr = start_relay().await;
    let t = SocketTransport::new(
        PeerId::from("hb"),
        SocketOptions {
            heartbeat_interval: Duration::from_millis(50),
            ..options(addr, "hb")
        },
    );
    let mut rx = events(&t);
    assert_ok!(t.connect().await);

    let latency = wait_for(&mut rx, Duration::from_secs(2), |e| {
        matches!(e, TransportEvent::Latency(_))
    })
    .await;
    match latency {
        Some(TransportEvent::Latency(rtt)) => assert!(rtt < Duration::from_secs(1)),
        other => panic!("expected a latency event, got {other:?}"),
    }
    assert_ok!(t.disconnect().await);
}

#[tokio::test]
async fn test_exhausted_reconnects_are_fatal() {
    let addr = closed_addr().await;
    let t = SocketTransport::new(
        PeerId::from("f"),
        SocketOptions {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
            ..options(addr, "gone")
        },
    );
    let mut rx = events(&t);

    assert_err!(t.connect().await);

    let fatal = wait_for(&mut rx, Duration::from_secs(2), |e| {
        matches!(e, TransportEvent::Fatal(_))
    })
    .await;
    assert!(fatal.is_some(), "expected a fatal event");
    assert_eq!(t.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_reconnects_once_relay_appears() {
    let addr = closed_addr().await;
    let t = SocketTransport::new(
        PeerId::from("late"),
        SocketOptions {
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 5,
            ..options(addr, "late")
        },
    );
    let mut rx = events(&t);

    assert_err!(t.connect().await);
    start_relay_on(TcpListener::bind(addr).await.unwrap()).await;

    let connected = wait_for(&mut rx, Duration::from_secs(5), |e| {
        *e == TransportEvent::StateChanged(ConnectionState::Connected)
    })
    .await;
    assert!(connected.is_some(), "transport never reconnected");
    assert!(t.is_connected());
    assert_ok!(t.disconnect().await);
}

#[tokio::test]
async fn test_send_from_connected_listener() {
    let addr = start_relay().await;
    let b = SocketTransport::new(PeerId::from("b"), options(addr, "eager"));
    let mut b_rx = messages(&b);
    assert_ok!(b.connect().await);

    let a = Arc::new(SocketTransport::new(PeerId::from("a"), options(addr, "eager")));
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let weak = Arc::downgrade(&a);
    a.on_event(Arc::new(move |e| {
        if e != TransportEvent::StateChanged(ConnectionState::Connected) {
            return;
        }
        if let Some(a) = weak.upgrade() {
            let sent = futures::executor::block_on(a.send(&state("a", 1)));
            let _ = sent_tx.send(sent.is_ok());
        }
    }))
    .detach();

    assert_ok!(a.connect().await);
    let sent = wait_for(&mut sent_rx, Duration::from_secs(2), |_| true).await;
    assert_eq!(sent, Some(true), "send inside the Connected listener failed");

    let got = wait_for(&mut b_rx, Duration::from_secs(2), |_| true).await.unwrap();
    assert_eq!(got.source.as_str(), "a");
    assert_ok!(a.disconnect().await);
}

#[tokio::test]
async fn test_dropped_session_reconnects_with_fresh_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let t = SocketTransport::new(
        PeerId::from("flaky"),
        SocketOptions {
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts: 2,
            ..options(addr, "flaky")
        },
    );
    let mut rx = events(&t);

    let (connected, session) = tokio::join!(t.connect(), accept_session(&listener));
    assert_ok!(connected);

    // first outage: the relay drops the session and takes the redial
    drop(session);
    let dropped = wait_for(&mut rx, Duration::from_secs(2), |e| {
        *e == TransportEvent::StateChanged(ConnectionState::Disconnected)
    })
    .await;
    assert!(dropped.is_some(), "dropped session went unnoticed");
    let session = accept_session(&listener).await;
    let reconnected = wait_for(&mut rx, Duration::from_secs(2), |e| {
        *e == TransportEvent::StateChanged(ConnectionState::Connected)
    })
    .await;
    assert!(reconnected.is_some(), "transport never reconnected");
    assert!(t.is_connected());

    // second outage: the relay is gone for good
    drop(listener);
    drop(session);
    let mut failed_dials = 0;
    let fatal = wait_for(&mut rx, Duration::from_secs(5), |e| match e {
        TransportEvent::Error(reason) if reason.starts_with("connecting to") => {
            failed_dials += 1;
            false
        }
        e => matches!(e, TransportEvent::Fatal(_)),
    })
    .await;
    assert!(fatal.is_some(), "expected a fatal event");
    // a reconnect that succeeded restores the whole attempt budget
    assert_eq!(failed_dials, 2);
    assert_eq!(t.state(), ConnectionState::Failed);
}
