use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use flowgate_core::approval::{ApprovalRequest, AuditEntry};
use flowgate_core::checkpoint::{Checkpoint, RunStatus};
use flowgate_core::state::StatePatch;
use flowgate_core::types::ThreadId;
use flowgate_engine::{RunOutcome, ThreadStatus};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Workflows ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExecuteBody {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

// POST /workflows/execute
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> ApiResult<RunOutcome> {
    let thread_id = body.thread_id.as_deref().map(ThreadId::from_string);
    let outcome = state
        .service
        .execute(&body.message, thread_id, body.metadata)
        .await?;
    info!(thread_id = %outcome.thread_id, status = %outcome.status, "Workflow executed");
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct ThreadQuery {
    pub thread_id: String,
}

// GET /workflows/status?thread_id=
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ThreadQuery>,
) -> ApiResult<ThreadStatus> {
    let status = state
        .service
        .status(&ThreadId::from_string(&q.thread_id))
        .await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
pub struct ResumeBody {
    pub thread_id: String,
    #[serde(default)]
    pub patch: StatePatch,
}

// POST /workflows/resume
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResumeBody>,
) -> ApiResult<RunOutcome> {
    let outcome = state
        .service
        .resume(&ThreadId::from_string(&body.thread_id), body.patch)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct CancelBody {
    pub thread_id: String,
}

// POST /workflows/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CancelBody>,
) -> ApiResult<ThreadStatus> {
    let status = state
        .service
        .cancel(&ThreadId::from_string(&body.thread_id))
        .await?;
    Ok(Json(status))
}

/// One row of `GET /workflows/history`.
#[derive(Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub node: String,
    pub status: RunStatus,
    pub step: usize,
    pub node_completed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            checkpoint_id: cp.checkpoint_id.clone(),
            parent_checkpoint_id: cp.parent_checkpoint_id.clone(),
            node: cp.metadata.node.clone(),
            status: cp.metadata.status,
            step: cp.metadata.step,
            node_completed: cp.metadata.node_completed,
            created_at: cp.created_at,
        }
    }
}

// GET /workflows/history?thread_id=
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ThreadQuery>,
) -> ApiResult<Vec<CheckpointSummary>> {
    let history = state
        .service
        .history(&ThreadId::from_string(&q.thread_id))
        .await?;
    Ok(Json(history.iter().map(CheckpointSummary::from).collect()))
}

// ── Approvals ───────────────────────────────────────────────────

// GET /approvals/pending
pub async fn pending_approvals(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ApprovalRequest>> {
    Ok(Json(state.service.pending_approvals().await?))
}

#[derive(Serialize)]
pub struct ApprovalDetail {
    pub request: ApprovalRequest,
    pub audit: Vec<AuditEntry>,
}

// GET /approvals/{id}
pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ApprovalDetail> {
    let approvals = state.service.approvals();
    let request = approvals.check_expired(&id).await?;
    let audit = approvals.audit_trail(&id).await?;
    Ok(Json(ApprovalDetail { request, audit }))
}

#[derive(Deserialize)]
pub struct DecisionBody {
    pub approved: bool,
    pub reviewer_id: String,
    #[serde(default)]
    pub comment: Option<String>,
}

// POST /approvals/{id}/decision
pub async fn decide(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<RunOutcome> {
    let outcome = state
        .service
        .decide(&id, body.approved, &body.reviewer_id, body.comment)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct EscalateBody {
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_actor() -> String {
    "api".to_string()
}

// POST /approvals/{id}/escalate
pub async fn escalate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EscalateBody>,
) -> ApiResult<ApprovalRequest> {
    Ok(Json(state.service.escalate(&id, &body.actor).await?))
}
