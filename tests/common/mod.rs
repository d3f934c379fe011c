#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use httpwarp::{ClientConfig, ClientListener, RelayConfig, RelayServer, SessionRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const PATH: &str = "/data/put";

/// Loopback echo server
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// Backend that reads `expect` bytes, answers `reply`, then hangs up
pub async fn spawn_one_shot(expect: usize, reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; expect];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                }
            });
        }
    });
    addr
}

pub struct Relay {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
}

pub async fn spawn_relay() -> Relay {
    let config = RelayConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        path: PATH.to_string(),
        connect_timeout_secs: 2,
    };
    let server = RelayServer::bind(Arc::new(config)).await.unwrap();
    let relay = Relay {
        addr: server.local_addr().unwrap(),
        registry: server.registry(),
    };
    tokio::spawn(server.run());
    relay
}

pub fn client_config(relay: SocketAddr, backend: SocketAddr) -> ClientConfig {
    ClientConfig {
        listen_addr: "127.0.0.1".parse().unwrap(),
        listen_port: 0,
        relay: relay.to_string(),
        path: PATH.to_string(),
        backend_host: backend.ip().to_string(),
        backend_port: backend.port(),
        connect_timeout_secs: 2,
        ..Default::default()
    }
}

pub async fn spawn_client(config: ClientConfig) -> SocketAddr {
    let listener = ClientListener::bind(Arc::new(config)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    addr
}

/// Relay + client listener in front of `backend`; returns the local address
/// applications connect to
pub async fn spawn_tunnel(backend: SocketAddr) -> (SocketAddr, Relay) {
    let relay = spawn_relay().await;
    let client = spawn_client(client_config(relay.addr, backend)).await;
    (client, relay)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait for the relay to release every backend connection and registry entry
pub async fn drained(relay: &Relay) -> bool {
    let registry = relay.registry.clone();
    eventually(move || {
        let registry = registry.clone();
        async move { registry.is_empty().await && registry.session_count().await == 0 }
    })
    .await
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) + 7) as u8).collect()
}
