use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::Result;

use super::registry::SessionRegistry;
use super::session;

/// Shared state handed to the upgrade handler
#[derive(Clone)]
struct RelayState {
    registry: Arc<SessionRegistry>,
}

/// HTTP endpoint that upgrades requests on the configured path to relay
/// sessions.
pub struct RelayServer {
    listener: TcpListener,
    router: Router,
    registry: Arc<SessionRegistry>,
}

impl RelayServer {
    /// Bind the configured address with the default TCP backend dialer
    pub async fn bind(config: Arc<RelayConfig>) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::with_timeout(config.connect_timeout()));
        Self::bind_with_registry(config, registry).await
    }

    pub async fn bind_with_registry(
        config: Arc<RelayConfig>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_socket()).await?;
        let router = build_router(&config.path, registry.clone());

        info!(
            "Relay listening on {}{}",
            listener.local_addr()?,
            config.path
        );

        Ok(Self {
            listener,
            router,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        axum::serve(
            self.listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

/// Build the router: every method on `path` goes through the upgrade handler
pub fn build_router(path: &str, registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route(path, any(upgrade_handler))
        .with_state(RelayState { registry })
}

async fn upgrade_handler(
    State(state): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws
            .on_failed_upgrade(move |e| warn!(peer = %peer, "WebSocket upgrade failed: {}", e))
            .on_upgrade(move |socket| session::run(socket, peer, state.registry))
            .into_response(),
        Err(rejection) => {
            warn!(peer = %peer, "Rejected non-upgrade request: {}", rejection);
            rejection.into_response()
        }
    }
}
