//! Lifecycle plumbing shared by client and relay sessions.
//!
//! - [`Teardown`] - single-fire completion token carrying a [`CloseReason`]
//! - [`Lifecycle`] - forward-only `Establishing -> Open -> Closing -> Closed`
//! - [`guarded`] - runs a session task and turns a panic into a teardown

use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Upper bound on the WebSocket close handshake during teardown
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The local application closed its connection or went away
    LocalClosed,
    /// The WebSocket peer closed or the WebSocket failed
    RemoteClosed,
    /// The relay's backend connection reached end-of-stream or failed
    BackendClosed,
    /// Dialing the relay or the backend failed
    DialFailed,
    /// An envelope could not be decoded where that is fatal
    DecodeError,
    /// A session task panicked
    Fault,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::LocalClosed => "local connection closed",
            CloseReason::RemoteClosed => "websocket closed",
            CloseReason::BackendClosed => "backend connection closed",
            CloseReason::DialFailed => "dial failed",
            CloseReason::DecodeError => "envelope decode error",
            CloseReason::Fault => "session task fault",
        };
        f.write_str(s)
    }
}

/// Single-fire teardown notification shared by the tasks of one session.
///
/// Only the first [`fire`](Teardown::fire) counts; the reason it carries is
/// what [`wait`](Teardown::wait) resolves with.
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal teardown. Returns `true` if this call was the first.
    pub fn fire(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the first signal
    pub async fn wait(&self) -> CloseReason {
        self.token.cancelled().await;
        self.reason.get().copied().unwrap_or(CloseReason::Fault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Establishing = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Establishing,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Session state that only ever moves forward
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle(AtomicU8::new(SessionState::Establishing as u8))
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Refused (returns `false`) unless `next` is later than
    /// the current state.
    pub fn advance(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (next as u8 > cur).then_some(next as u8)
            })
            .is_ok()
    }

    /// Like [`advance`](Lifecycle::advance), but a refused transition is
    /// logged since it means a session step ran out of order.
    pub fn enter(&self, next: SessionState) {
        if !self.advance(next) {
            warn!(from = ?self.state(), to = ?next, "Refused session state transition");
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one session task. A panic inside `task` is logged and converted into
/// `CloseReason::Fault` for this session only.
pub async fn guarded<F>(task: F, teardown: Teardown, name: &'static str)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        error!(task = name, "Session task panicked: {}", panic_message(&*panic));
        teardown.fire(CloseReason::Fault);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
