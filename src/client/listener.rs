use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::SessionIdGen;

use super::session;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Local TCP listener; every accepted connection gets its own tunnel session
pub struct ClientListener {
    listener: TcpListener,
    config: Arc<ClientConfig>,
    ids: SessionIdGen,
}

impl ClientListener {
    pub async fn bind(config: Arc<ClientConfig>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_socket()).await?;

        info!(
            "Listening on {}, tunneling to {} via {}",
            listener.local_addr()?,
            config.target(),
            config.relay_url()?
        );

        Ok(Self {
            listener,
            config,
            ids: SessionIdGen::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever. Accept errors are logged and never end the loop.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.ids.next();
                    tokio::spawn(session::run(id, stream, peer, self.config.clone()));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
}
