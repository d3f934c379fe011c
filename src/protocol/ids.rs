//! Type-safe ID wrappers for session identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one tunnel session.
///
/// On the relay this is the only handle used to correlate a WebSocket peer
/// with its backend connection; on the client it only tags log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(n: u64) -> Self {
        SessionId(n)
    }
}

/// Monotonic source of [`SessionId`]s. Never hands out the same id twice.
#[derive(Debug)]
pub struct SessionIdGen(AtomicU64);

impl SessionIdGen {
    pub const fn new() -> Self {
        SessionIdGen(AtomicU64::new(1))
    }

    pub fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIdGen {
    fn default() -> Self {
        Self::new()
    }
}
