use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use relay_engine::RelayCoordinator;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::{build_router, AppState};

/// HTTP front of a relay.
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<RelayCoordinator>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<RelayCoordinator>) -> Self {
        Self { config, relay }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            relay: self.relay.clone(),
            config: self.config.clone(),
        })
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "relay HTTP surface listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}
