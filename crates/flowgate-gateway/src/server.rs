use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowgate_core::config::GatewayConfig;
use flowgate_engine::WorkflowService;

use crate::routes;
use crate::state::AppState;

/// Build the HTTP router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Workflows
        .route("/workflows/execute", post(routes::execute))
        .route("/workflows/status", get(routes::status))
        .route("/workflows/resume", post(routes::resume))
        .route("/workflows/cancel", post(routes::cancel))
        .route("/workflows/history", get(routes::history))
        // Approvals
        .route("/approvals/pending", get(routes::pending_approvals))
        .route("/approvals/{id}", get(routes::get_approval))
        .route("/approvals/{id}/decision", post(routes::decide))
        .route("/approvals/{id}/escalate", post(routes::escalate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    service: WorkflowService,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: WorkflowService) -> Self {
        Self { config, service }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
