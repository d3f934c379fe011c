//! Configuration for both tunnel roles.
//!
//! Values come from `~/.config/httpwarp/config.toml` (or `--config`), are
//! overridden by CLI flags, and are then frozen into [`ClientConfig`] /
//! [`RelayConfig`] values shared by every session for its whole lifetime.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::TunnelError;
use crate::protocol::Target;

pub const DEFAULT_PATH: &str = "/data/put";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Settings for the local listener side of the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local TCP port applications connect to
    pub listen_port: u16,
    /// Address the local listener binds
    pub listen_addr: IpAddr,
    /// Relay `host[:port]`
    pub relay: String,
    /// URL path of the relay's WebSocket endpoint
    pub path: String,
    /// Use `wss://` when dialing the relay
    pub tls: bool,
    /// Backend host the relay should dial
    pub backend_host: String,
    /// Backend port the relay should dial
    pub backend_port: u16,
    /// WebSocket dial timeout in seconds
    pub connect_timeout_secs: u64,
    /// Send backend routing only on the first envelope of a session
    pub route_once: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_port: 10086,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay: String::new(),
            path: DEFAULT_PATH.to_string(),
            tls: false,
            backend_host: "0.0.0.0".to_string(),
            backend_port: 0,
            connect_timeout_secs: 10,
            route_once: false,
        }
    }
}

impl ClientConfig {
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn target(&self) -> Target {
        Target::new(self.backend_host.clone(), self.backend_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// WebSocket URL of the relay endpoint
    pub fn relay_url(&self) -> Result<Url, TunnelError> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let url = Url::parse(&format!("{}://{}{}", scheme, self.relay, self.path))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(TunnelError::Config(format!(
                "relay host missing in {:?}",
                self.relay
            )));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.relay.is_empty() {
            return Err(TunnelError::Config("relay host is required".to_string()));
        }
        if self.backend_port == 0 {
            return Err(TunnelError::Config("backend port is required".to_string()));
        }
        if self.backend_host.is_empty() {
            return Err(TunnelError::Config("backend host is required".to_string()));
        }
        validate_path(&self.path)?;
        self.relay_url().map(|_| ())
    }
}

/// Settings for the HTTP/WebSocket relay side of the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// URL path upgraded to WebSocket
    pub path: String,
    /// Backend dial timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            path: DEFAULT_PATH.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn bind_socket(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        validate_path(&self.path)
    }
}

fn validate_path(path: &str) -> Result<(), TunnelError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(TunnelError::Config(format!(
            "URL path must start with '/': {:?}",
            path
        )))
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "httpwarp")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();

        assert_eq!(config.client.listen_port, 10086);
        assert_eq!(config.client.path, "/data/put");
        assert_eq!(config.relay.port, 80);
        assert_eq!(config.relay.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[client]\nrelay = \"relay.example.com:8080\"\nbackend_port = 22\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client.relay, "relay.example.com:8080");
        assert_eq!(config.client.backend_port, 22);
        assert_eq!(config.client.backend_host, "0.0.0.0");
        assert_eq!(config.relay.path, DEFAULT_PATH);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.relay.port = 8080;
        original.client.route_once = true;
        original.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.relay.port, 8080);
        assert!(loaded.client.route_once);
    }

    #[test]
    fn test_relay_url() {
        let config = ClientConfig {
            relay: "relay.example.com:8080".to_string(),
            backend_port: 9000,
            ..Default::default()
        };
        assert_eq!(
            config.relay_url().unwrap().as_str(),
            "ws://relay.example.com:8080/data/put"
        );
        assert!(config.validate().is_ok());

        let tls = ClientConfig {
            tls: true,
            ..config.clone()
        };
        assert!(tls.relay_url().unwrap().as_str().starts_with("wss://"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(ClientConfig::default().validate().is_err());

        let no_port = ClientConfig {
            relay: "relay".to_string(),
            ..Default::default()
        };
        assert!(no_port.validate().is_err());

        let relay = RelayConfig {
            path: "data/put".to_string(),
            ..Default::default()
        };
        assert!(relay.validate().is_err());
    }
}
