//! Wire format for tunnel traffic.
//!
//! Every WebSocket message is one JSON [`Envelope`] carrying a base64 chunk of
//! a TCP byte stream, plus backend routing metadata in the client -> relay
//! direction. Also provides the [`SessionId`] newtype.

mod envelope;
mod ids;

pub use envelope::*;
pub use ids::*;
