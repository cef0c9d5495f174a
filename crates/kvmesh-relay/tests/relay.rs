//! Relay fan-out, heartbeat acks and metrics over real websocket clients.

use futures::{SinkExt, StreamExt};
use kvmesh_core::{MessageType, PeerId, SyncMessage};
use kvmesh_relay::{serve, RelayState};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, RelayState::new(64)));
    addr
}

async fn client(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, message: &SyncMessage) {
    ws.send(Message::Text(message.to_json().unwrap().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Client) -> Option<SyncMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_millis(500), ws.next())
            .await
            .ok()??
            .ok()?;
        if let Message::Text(text) = frame {
            return SyncMessage::from_json(text.as_str()).ok();
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn state_message(source: &str, key: &str) -> SyncMessage {
    SyncMessage::new(
        format!("{source}-1"),
        MessageType::State,
        PeerId::from(source),
        json!({ "key": key, "value": 1, "previous": null }),
        1,
    )
}

#[tokio::test]
async fn test_fan_out_skips_sender() {
    let addr = start_relay().await;
    let mut a = client(addr, "/ws/room").await;
    let mut b = client(addr, "/ws/room").await;
    let mut other = client(addr, "/ws/elsewhere").await;
    // let both subscriptions settle before sending
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut a, &state_message("a", "x")).await;

    let got = recv(&mut b).await.expect("b should receive a's frame");
    assert_eq!(got.source.as_str(), "a");
    assert!(recv(&mut a).await.is_none(), "sender received its own frame");
    assert!(recv(&mut other).await.is_none(), "frame leaked to another room");
}

#[tokio::test]
async fn test_heartbeat_acked_and_forwarded() {
    let addr = start_relay().await;
    let mut a = client(addr, "/ws/hb").await;
    let mut b = client(addr, "/ws/hb").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let hb = SyncMessage::new("a-hb-1", MessageType::Heartbeat, PeerId::from("a"), json!({}), 0);
    send(&mut a, &hb).await;

    let ack = recv(&mut a).await.expect("relay should ack the heartbeat");
    assert_eq!(ack.kind, MessageType::Ack);
    assert_eq!(ack.source.as_str(), "relay");
    assert_eq!(ack.data["heartbeat"], "a-hb-1");

    let forwarded = recv(&mut b).await.expect("heartbeat should still be forwarded");
    assert_eq!(forwarded.kind, MessageType::Heartbeat);
}

#[tokio::test]
async fn test_signal_route_forwards_verbatim() {
    let addr = start_relay().await;
    let mut a = client(addr, "/signal/room").await;
    let mut b = client(addr, "/signal/room").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let raw = r#"{"type":"hello","from":"a"}"#;
    a.send(Message::Text(raw.to_string().into())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), b.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text(raw.to_string().into()));
}

#[tokio::test]
async fn test_health_and_metrics() {
    let addr = start_relay().await;
    let _a = client(addr, "/ws/m").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let health = http_get(addr, "/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("ok"));

    let metrics = http_get(addr, "/metrics").await;
    assert!(metrics.contains("kvmesh_relay_connections 1"));
    assert!(metrics.contains("kvmesh_relay_frames_forwarded_total"));
    assert!(metrics.contains("kvmesh_relay_heartbeats_acked_total"));
}
