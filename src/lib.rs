//! HttpWarp: tunnel raw TCP connections over a WebSocket relay.
//!
//! A client accepts local TCP connections and opens one WebSocket per
//! connection to a relay. The relay upgrades HTTP requests on a configured
//! path, dials the backend named in the envelopes it receives, and pumps the
//! backend's bytes back over the same WebSocket.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod session;

pub use client::ClientListener;
pub use config::{ClientConfig, Config, RelayConfig};
pub use error::{Result, TunnelError};
pub use relay::{RelayServer, SessionRegistry};
