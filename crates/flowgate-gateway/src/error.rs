use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use flowgate_core::error::FlowgateError;

/// A `FlowgateError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub FlowgateError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FlowgateError::ThreadNotFound(_) | FlowgateError::ApprovalNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FlowgateError::ThreadNotResumable(_)
            | FlowgateError::InvalidStateTransition { .. }
            | FlowgateError::CheckpointConflict { .. } => StatusCode::CONFLICT,
            FlowgateError::InvalidState(_) | FlowgateError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            FlowgateError::ThreadNotFound(_) => "thread_not_found",
            FlowgateError::ApprovalNotFound(_) => "approval_not_found",
            FlowgateError::ThreadNotResumable(_) => "thread_not_resumable",
            FlowgateError::InvalidStateTransition { .. } => "invalid_state_transition",
            FlowgateError::CheckpointConflict { .. } => "checkpoint_conflict",
            FlowgateError::InvalidState(_) | FlowgateError::Json(_) => "invalid_request",
            _ => "internal",
        }
    }
}

impl From<FlowgateError> for ApiError {
    fn from(e: FlowgateError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
