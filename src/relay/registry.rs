//! Session registry: relay session -> its current backend TCP connection.
//!
//! Each session owns one slot guarded by its own async mutex. Lookup, stale
//! replacement, dial and install all happen while that slot is held, so two
//! envelopes racing on a new session can never both dial.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::{SessionId, SessionIdGen, Target};

/// Opens backend TCP connections for the registry
pub trait Dial: Send + Sync + 'static {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, io::Result<TcpStream>>;
}

/// Plain TCP dialer with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Dial for TcpDialer {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, io::Result<TcpStream>> {
        Box::pin(async move {
            let connect = TcpStream::connect((target.host.as_str(), target.port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.timeout),
                )),
            }
        })
    }
}

/// How [`SessionRegistry::deliver`] got the payload to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the connection already in the registry
    Reused,
    /// A backend connection was (re)dialed for this payload
    Dialed,
}

/// A live backend connection. The registry holds the write half; the read
/// half belongs to the backend reader task.
struct BackendConn {
    target: Target,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    /// Cancelled once the reader has exited and dropped its half
    released: CancellationToken,
}

impl BackendConn {
    fn is_released(&self) -> bool {
        self.released.is_cancelled() || self.reader.is_finished()
    }

    /// Release both halves. Consumes the connection so it cannot be closed twice.
    async fn close(mut self) {
        self.reader.abort();
        let _ = self.writer.shutdown().await;
        let _ = self.reader.await;
    }
}

type Slot = Arc<Mutex<Option<BackendConn>>>;

pub struct SessionRegistry {
    dialer: Arc<dyn Dial>,
    ids: SessionIdGen,
    slots: RwLock<HashMap<SessionId, Slot>>,
}

impl SessionRegistry {
    pub fn new(dialer: Arc<dyn Dial>) -> Self {
        Self {
            dialer,
            ids: SessionIdGen::new(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Arc::new(TcpDialer::new(timeout)))
    }

    /// Assign the identity of a new relay session
    pub fn next_session_id(&self) -> SessionId {
        self.ids.next()
    }

    async fn slot(&self, id: SessionId) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&id) {
            return slot.clone();
        }
        self.slots.write().await.entry(id).or_default().clone()
    }

    /// Write `payload` to the session's backend, dialing `target` first when
    /// there is no usable connection.
    ///
    /// A failed write to an existing connection closes it and redials. On a
    /// fresh dial, `spawn_reader` is handed the read half and its future is
    /// spawned as the backend reader. Only a dial failure is returned as an
    /// error; a write failure on the fresh connection is logged.
    pub async fn deliver<F, Fut>(
        &self,
        id: SessionId,
        target: &Target,
        payload: &[u8],
        spawn_reader: F,
    ) -> Result<Delivery>
    where
        F: FnOnce(OwnedReadHalf) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = self.slot(id).await;
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.as_mut() {
            if conn.is_released() {
                debug!(session = %id, "Backend connection released by reader, redialing");
            } else {
                match conn.writer.write_all(payload).await {
                    Ok(()) => return Ok(Delivery::Reused),
                    Err(e) => {
                        warn!(
                            session = %id,
                            backend = %conn.target,
                            "Backend write failed, redialing: {}",
                            e
                        );
                    }
                }
            }
        }

        if let Some(stale) = guard.take() {
            stale.close().await;
        }

        let stream = self
            .dialer
            .dial(target)
            .await
            .map_err(|source| TunnelError::Dial {
                target: target.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        info!(session = %id, backend = %target, "Backend connected");

        let (read_half, writer) = stream.into_split();
        let released = CancellationToken::new();
        let reader_future = spawn_reader(read_half);
        let on_exit = released.clone();
        let reader = tokio::spawn(async move {
            reader_future.await;
            on_exit.cancel();
        });

        let conn = guard.insert(BackendConn {
            target: target.clone(),
            writer,
            reader,
            released,
        });

        if let Err(e) = conn.writer.write_all(payload).await {
            warn!(
                session = %id,
                backend = %target,
                "Write to fresh backend connection failed: {}",
                e
            );
        }

        Ok(Delivery::Dialed)
    }

    /// Close the session's backend connection (if any) and drop its entry
    pub async fn remove(&self, id: SessionId) {
        let slot = self.slots.write().await.remove(&id);
        if let Some(slot) = slot {
            if let Some(conn) = slot.lock().await.take() {
                debug!(session = %id, backend = %conn.target, "Closing backend connection");
                conn.close().await;
            }
        }
    }

    /// Number of sessions currently holding a backend connection
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of registry entries, including sessions whose backend slot is empty
    pub async fn session_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether the session has a backend entry whose reader already exited
    pub async fn is_stale(&self, id: SessionId) -> bool {
        let slot = self.slots.read().await.get(&id).cloned();
        match slot {
            Some(slot) => slot.lock().await.as_ref().is_some_and(BackendConn::is_released),
            None => false,
        }
    }
}
