//! API Server
//!
//! Binds the registration API once the manager is warm and serves it until
//! the shutdown token fires.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::Manager;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Registration API server
pub struct ApiServer {
    config: ApiServerConfig,
    manager: Arc<Manager>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: Arc<Manager>) -> Self {
        Self { config, manager }
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Refuses to start before the manager has warmed up, since requests
    /// would otherwise run against empty caches.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.manager.is_ready() {
            return Err(Error::Internal(
                "API server started before manager warm-up".into(),
            ));
        }

        let app = RestRouter::new(self.manager.clone()).build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}
