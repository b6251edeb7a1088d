//! API server

use axum::{
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use crate::config::ApiConfig;
use crate::error::Result;
use crate::relay::RelayHub;

/// State shared by every handler
pub struct AppState {
    pub hub: Arc<RelayHub>,
}

/// Status API bound to one relay
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, hub: Arc<RelayHub>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { hub }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/stats", get(handlers::get_stats))
            .route("/api/routing", get(handlers::get_routing))
            .route("/api/routing/:channel", put(handlers::update_route))
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Bind and serve until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Status API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Serve on a background task
    pub fn start_background(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                tracing::error!("Status API error: {}", e);
            }
        })
    }
}
