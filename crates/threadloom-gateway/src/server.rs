use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use threadloom_core::config::AppConfig;
use threadloom_core::event::EventBus;
use threadloom_core::traits::{ChatBackend, GraphStore};

use crate::routes;
use crate::state::AppState;

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn GraphStore>,
        backend: Arc<dyn ChatBackend>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state: Arc::new(AppState::new(config, store, backend, event_bus)),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            // WebSocket
            .route("/ws", get(routes::ws_handler))
            // REST API
            .route("/api/health", get(routes::health))
            .route("/api/graphs", get(routes::list_graphs))
            .route("/api/graphs/{id}", get(routes::get_graph).put(routes::put_graph))
            .route("/api/graphs/{id}/plan", get(routes::plan))
            .route("/api/graphs/{id}/connect", post(routes::connect))
            .route("/api/graphs/{id}/edges/{edge_id}", delete(routes::delete_edge))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.state.config.gateway.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(bind = %addr, "Gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
