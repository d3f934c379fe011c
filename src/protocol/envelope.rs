use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TunnelError};

/// Backend TCP endpoint the relay dials on behalf of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The unit exchanged over the WebSocket connection.
///
/// `data` holds a slice of one side's TCP stream, base64 encoded. The routing
/// fields only ever appear on client -> relay envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
    #[serde(
        rename = "app_srv_ip",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_host: Option<String>,
    #[serde(
        rename = "app_srv_port",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_port: Option<String>,
}

impl Envelope {
    /// Client -> relay envelope. `target` is `None` when routing was already
    /// sent earlier in the session.
    pub fn upstream(payload: &[u8], target: Option<&Target>) -> Self {
        Envelope {
            data: encode_payload(payload),
            target_host: target.map(|t| t.host.clone()),
            target_port: target.map(|t| t.port.to_string()),
        }
    }

    /// Relay -> client envelope, payload only
    pub fn downstream(payload: &[u8]) -> Self {
        Envelope {
            data: encode_payload(payload),
            target_host: None,
            target_port: None,
        }
    }

    /// Decode the payload back to the exact bytes read from the socket
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.data)?)
    }

    /// Routing metadata carried by this envelope, if any.
    ///
    /// Host and port must be present together; the port must be a non-zero
    /// decimal number.
    pub fn target(&self) -> Result<Option<Target>> {
        match (&self.target_host, &self.target_port) {
            (None, None) => Ok(None),
            (Some(host), Some(port)) => {
                if host.is_empty() {
                    return Err(TunnelError::Routing("empty backend host".to_string()));
                }
                let port = port
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| TunnelError::Routing(format!("bad backend port {:?}", port)))?;
                Ok(Some(Target::new(host.clone(), port)))
            }
            (Some(_), None) => Err(TunnelError::Routing(
                "backend host without port".to_string(),
            )),
            (None, Some(_)) => Err(TunnelError::Routing(
                "backend port without host".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn encode_payload(payload: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(payload)
}
