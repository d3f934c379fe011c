//! Client side of the tunnel.
//!
//! - [`ClientListener`] - accepts local TCP connections
//! - [`session`] - one WebSocket to the relay per local connection, with an
//!   upstream and a downstream pump

mod listener;
pub mod session;

pub use listener::ClientListener;
