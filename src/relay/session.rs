use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::protocol::{Envelope, SessionId, Target};
use crate::session::{guarded, CloseReason, Lifecycle, SessionState, Teardown, CLOSE_TIMEOUT};

use super::registry::SessionRegistry;

/// Bytes read from the backend per downstream envelope
pub const BACKEND_READ_BUFFER: usize = 32 * 1024;

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Drive one upgraded WebSocket until teardown.
///
/// Runs the demultiplexing loop as its own task; backend readers are spawned
/// by the registry whenever a backend connection is dialed. Returns only after
/// the backend connection, the registry entry and the WebSocket are released.
pub async fn run(socket: WebSocket, peer: SocketAddr, registry: Arc<SessionRegistry>) {
    let id = registry.next_session_id();
    let lifecycle = Lifecycle::new();
    let teardown = Teardown::new();

    let (sink, stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    lifecycle.enter(SessionState::Open);
    info!(session = %id, peer = %peer, "Relay session opened");

    let demux = tokio::spawn(guarded(
        demux_loop(id, stream, registry.clone(), sink.clone(), teardown.clone()),
        teardown.clone(),
        "demux",
    ));

    let reason = teardown.wait().await;
    lifecycle.enter(SessionState::Closing);
    debug!(session = %id, reason = %reason, "Relay session closing");

    demux.abort();
    let _ = demux.await;
    registry.remove(id).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;

    lifecycle.enter(SessionState::Closed);
    info!(session = %id, peer = %peer, reason = %reason, "Relay session closed");
}

async fn demux_loop(
    id: SessionId,
    mut stream: SplitStream<WebSocket>,
    registry: Arc<SessionRegistry>,
    sink: WsSink,
    teardown: Teardown,
) {
    // Most recent routing seen on this session, for clients that only route once
    let mut route: Option<Target> = None;

    while let Some(msg) = stream.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                debug!(session = %id, "Client closed websocket: {:?}", frame.map(|f| f.reason));
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %id, "WebSocket read error: {}", e);
                break;
            }
        };

        let (payload, target) = match decode(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(session = %id, "Dropping malformed envelope: {}", e);
                continue;
            }
        };

        if let Some(target) = target {
            route = Some(target);
        }
        let Some(target) = route.as_ref() else {
            warn!(session = %id, "Dropping envelope without backend routing");
            continue;
        };

        let reader_sink = sink.clone();
        let reader_teardown = teardown.clone();
        let delivered = registry
            .deliver(id, target, &payload, move |reader| {
                guarded(
                    backend_reader(id, reader, reader_sink, reader_teardown.clone()),
                    reader_teardown,
                    "backend-reader",
                )
            })
            .await;

        if let Err(e) = delivered {
            error!(session = %id, "{}", e);
            teardown.fire(CloseReason::DialFailed);
            return;
        }
    }

    teardown.fire(CloseReason::RemoteClosed);
}

fn decode(bytes: &[u8]) -> Result<(Vec<u8>, Option<Target>), TunnelError> {
    let envelope = Envelope::from_slice(bytes)?;
    Ok((envelope.payload()?, envelope.target()?))
}

/// Pump backend bytes back to the client until either side fails
async fn backend_reader(
    id: SessionId,
    mut reader: OwnedReadHalf,
    sink: WsSink,
    teardown: Teardown,
) {
    let mut buf = vec![0u8; BACKEND_READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(session = %id, "Backend closed connection");
                teardown.fire(CloseReason::BackendClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(session = %id, "Backend read error: {}", e);
                teardown.fire(CloseReason::BackendClosed);
                return;
            }
        };

        let json = match Envelope::downstream(&buf[..n]).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(session = %id, "Failed to encode envelope: {}", e);
                teardown.fire(CloseReason::Fault);
                return;
            }
        };

        if let Err(e) = sink.lock().await.send(Message::Text(json)).await {
            debug!(session = %id, "WebSocket send error: {}", e);
            teardown.fire(CloseReason::RemoteClosed);
            return;
        }
    }
}
