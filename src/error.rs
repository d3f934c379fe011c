use std::time::Duration;

use thiserror::Error;

use crate::protocol::Target;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid routing metadata: {0}")]
    Routing(String),

    #[error("Failed to connect to {target}: {source}")]
    Dial {
        target: Target,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} connecting to {endpoint}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Invalid relay URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
