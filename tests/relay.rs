//! Relay endpoint driven by a raw WebSocket peer

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use httpwarp::protocol::{Envelope, Target};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(relay: &Relay) -> Ws {
    let url = format!("ws://{}{}", relay.addr, PATH);
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    ws
}

fn target(addr: SocketAddr) -> Target {
    Target::new(addr.ip().to_string(), addr.port())
}

async fn send(ws: &mut Ws, envelope: &Envelope) {
    ws.send(Message::Text(envelope.to_json().unwrap()))
        .await
        .unwrap();
}

/// Collect downstream payloads until `len` bytes have arrived
async fn recv_bytes(ws: &mut Ws, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), async {
        while out.len() < len {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = Envelope::from_json(&text).unwrap();
                    assert!(envelope.target_host.is_none());
                    out.extend(envelope.payload().unwrap());
                }
                Some(Ok(_)) => continue,
                other => panic!("websocket ended early: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for backend data");
    out
}

/// True once the relay has closed the websocket
async fn closed(ws: &mut Ws) -> bool {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_malformed_envelope_does_not_end_session() {
    let echo = spawn_echo().await;
    let relay = spawn_relay().await;
    let mut ws = connect(&relay).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"data":"%%%"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"{"data":"aGk=","app_srv_ip":"127.0.0.1","app_srv_port":"nope"}"#.to_string(),
    ))
    .await
    .unwrap();

    send(&mut ws, &Envelope::upstream(b"still alive", Some(&target(echo)))).await;
    assert_eq!(recv_bytes(&mut ws, 11).await, b"still alive");
}

#[tokio::test]
async fn test_binary_frames_accepted() {
    let echo = spawn_echo().await;
    let relay = spawn_relay().await;
    let mut ws = connect(&relay).await;

    let json = Envelope::upstream(b"bin", Some(&target(echo)))
        .to_json()
        .unwrap();
    ws.send(Message::Binary(json.into_bytes())).await.unwrap();
    assert_eq!(recv_bytes(&mut ws, 3).await, b"bin");
}

#[tokio::test]
async fn test_routing_cached_for_route_once_clients() {
    let echo = spawn_echo().await;
    let relay = spawn_relay().await;
    let mut ws = connect(&relay).await;

    // nothing to route yet: dropped, session stays up
    send(&mut ws, &Envelope::upstream(b"lost", None)).await;

    send(&mut ws, &Envelope::upstream(b"one", Some(&target(echo)))).await;
    assert_eq!(recv_bytes(&mut ws, 3).await, b"one");

    send(&mut ws, &Envelope::upstream(b"two", None)).await;
    assert_eq!(recv_bytes(&mut ws, 3).await, b"two");
    assert_eq!(relay.registry.len().await, 1);
}

#[tokio::test]
async fn test_dial_failure_closes_websocket() {
    let relay = spawn_relay().await;
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let mut ws = connect(&relay).await;
    send(&mut ws, &Envelope::upstream(b"x", Some(&target(dead)))).await;

    assert!(closed(&mut ws).await, "relay kept a session with no backend");
    assert!(drained(&relay).await);
}

#[tokio::test]
async fn test_websocket_close_releases_backend() {
    let echo = spawn_echo().await;
    let relay = spawn_relay().await;
    let mut ws = connect(&relay).await;

    send(&mut ws, &Envelope::upstream(b"hey", Some(&target(echo)))).await;
    assert_eq!(recv_bytes(&mut ws, 3).await, b"hey");
    assert_eq!(relay.registry.len().await, 1);

    ws.close(None).await.unwrap();
    assert!(drained(&relay).await, "backend connection leaked");
}

#[tokio::test]
async fn test_non_upgrade_requests_rejected() {
    let echo = spawn_echo().await;
    let relay = spawn_relay().await;
    let http = reqwest::Client::new();
    let url = format!("http://{}{}", relay.addr, PATH);

    let get = http.get(&url).send().await.unwrap();
    assert!(get.status().is_client_error());

    let post = http.post(&url).body("data").send().await.unwrap();
    assert!(post.status().is_client_error());

    let other = http
        .get(format!("http://{}/elsewhere", relay.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), reqwest::StatusCode::NOT_FOUND);

    // the relay keeps serving after rejecting
    let mut ws = connect(&relay).await;
    send(&mut ws, &Envelope::upstream(b"ok", Some(&target(echo)))).await;
    assert_eq!(recv_bytes(&mut ws, 2).await, b"ok");
}
