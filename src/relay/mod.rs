//! Relay side of the tunnel.
//!
//! - [`RelayServer`] - HTTP endpoint upgrading requests on one path to WebSocket
//! - [`session`] - per-WebSocket demultiplexing loop and backend reader
//! - [`SessionRegistry`] - session -> backend TCP connection, shared by all sessions

mod registry;
mod server;
pub mod session;

pub use registry::{Delivery, Dial, SessionRegistry, TcpDialer};
pub use server::{build_router, RelayServer};
