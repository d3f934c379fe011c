use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{Envelope, SessionId, Target};
use crate::session::{guarded, CloseReason, Lifecycle, SessionState, Teardown, CLOSE_TIMEOUT};

/// Bytes read from the local connection per upstream envelope
pub const LOCAL_READ_BUFFER: usize = 32 * 1024;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RelaySink = Arc<Mutex<SplitSink<RelaySocket, Message>>>;

/// Tunnel one accepted local connection through a fresh WebSocket.
///
/// Dial failure closes the local connection straight away. Otherwise the
/// upstream and downstream pumps run until the first of them signals
/// teardown, after which both legs are released.
pub async fn run(id: SessionId, local: TcpStream, peer: SocketAddr, config: Arc<ClientConfig>) {
    let lifecycle = Lifecycle::new();

    let ws = match dial_relay(&config).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(session = %id, peer = %peer, "Failed to reach relay: {}", e);
            lifecycle.enter(SessionState::Closed);
            return;
        }
    };

    let _ = local.set_nodelay(true);
    let (local_read, local_write) = local.into_split();
    let (sink, stream) = ws.split();
    let sink: RelaySink = Arc::new(Mutex::new(sink));
    let teardown = Teardown::new();

    lifecycle.enter(SessionState::Open);
    info!(session = %id, peer = %peer, "Tunnel session opened");

    let route = if config.route_once {
        Route::Once(Some(config.target()))
    } else {
        Route::Every(config.target())
    };

    let upstream = tokio::spawn(guarded(
        upstream_pump(id, local_read, sink.clone(), route, teardown.clone()),
        teardown.clone(),
        "upstream",
    ));
    let downstream = tokio::spawn(guarded(
        downstream_pump(id, stream, local_write, teardown.clone()),
        teardown.clone(),
        "downstream",
    ));

    let reason = teardown.wait().await;
    lifecycle.enter(SessionState::Closing);

    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;

    lifecycle.enter(SessionState::Closed);
    info!(session = %id, peer = %peer, reason = %reason, "Tunnel session closed");
}

async fn dial_relay(config: &ClientConfig) -> Result<RelaySocket> {
    let url = config.relay_url()?;
    debug!("Connecting to relay {}", url);

    let timeout = config.connect_timeout();
    let (ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TunnelError::Timeout {
            endpoint: url.to_string(),
            timeout,
        })??;
    Ok(ws)
}

/// Which upstream envelopes carry backend routing
enum Route {
    Every(Target),
    /// Taken by the first envelope
    Once(Option<Target>),
}

impl Route {
    fn envelope(&mut self, payload: &[u8]) -> Envelope {
        match self {
            Route::Every(target) => Envelope::upstream(payload, Some(target)),
            Route::Once(target) => Envelope::upstream(payload, target.take().as_ref()),
        }
    }
}

async fn upstream_pump(
    id: SessionId,
    mut local: OwnedReadHalf,
    sink: RelaySink,
    mut route: Route,
    teardown: Teardown,
) {
    let mut buf = vec![0u8; LOCAL_READ_BUFFER];
    loop {
        let n = match local.read(&mut buf).await {
            Ok(0) => {
                debug!(session = %id, "Local connection closed");
                teardown.fire(CloseReason::LocalClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(session = %id, "Local read error: {}", e);
                teardown.fire(CloseReason::LocalClosed);
                return;
            }
        };

        let json = match route.envelope(&buf[..n]).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(session = %id, "Failed to encode envelope: {}", e);
                teardown.fire(CloseReason::Fault);
                return;
            }
        };

        if let Err(e) = sink.lock().await.send(Message::Text(json)).await {
            debug!(session = %id, "Send to relay failed: {}", e);
            teardown.fire(CloseReason::RemoteClosed);
            return;
        }
    }
}

async fn downstream_pump(
    id: SessionId,
    mut stream: SplitStream<RelaySocket>,
    mut local: OwnedWriteHalf,
    teardown: Teardown,
) {
    while let Some(msg) = stream.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                debug!(
                    session = %id,
                    "Relay closed connection: {:?}",
                    frame.map(|f| f.reason.to_string())
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %id, "WebSocket read error: {}", e);
                break;
            }
        };

        // A bad envelope here would desynchronize the local byte stream
        let payload = match Envelope::from_slice(&bytes)
            .map_err(TunnelError::from)
            .and_then(|envelope| envelope.payload())
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %id, "Undecodable envelope from relay: {}", e);
                teardown.fire(CloseReason::DecodeError);
                return;
            }
        };

        if let Err(e) = local.write_all(&payload).await {
            if is_peer_gone(&e) {
                debug!(session = %id, "Local peer gone: {}", e);
                teardown.fire(CloseReason::LocalClosed);
                return;
            }
            warn!(session = %id, "Write to local connection failed: {}", e);
        }
    }

    teardown.fire(CloseReason::RemoteClosed);
}

/// Write errors after which the local application can no longer receive data
pub fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
