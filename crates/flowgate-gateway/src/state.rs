use flowgate_core::config::GatewayConfig;
use flowgate_engine::WorkflowService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub service: WorkflowService,
}
