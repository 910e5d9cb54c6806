use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use flowgate_core::approval::{ApprovalDecision, ApprovalStatus};
use flowgate_core::error::FlowgateError;
use flowgate_core::state::{ApprovalContext, WorkflowState};
use flowgate_core::types::NodeError;

use super::manager::ApprovalManager;
use crate::graph::{Node, NodeResult};

/// Route label for content that needs no reviewer.
pub const SIMPLE: &str = "simple";
/// Route label for content that waits on a reviewer.
pub const SENSITIVE: &str = "sensitive";

/// Router for the node after `ApprovalAssessNode`.
pub fn approval_route(state: &WorkflowState) -> String {
    match state.approval_status() {
        Some(ApprovalStatus::Approved) => SIMPLE.to_string(),
        _ => SENSITIVE.to_string(),
    }
}

/// Scores the current draft and opens an approval request if needed.
///
/// The draft is read from `active_step_context[node][field]` when configured,
/// otherwise from the latest assistant message.
pub struct ApprovalAssessNode {
    manager: ApprovalManager,
    name: String,
    source: Option<(String, String)>,
}

impl ApprovalAssessNode {
    pub fn new(manager: ApprovalManager) -> Self {
        Self {
            manager,
            name: "assess_risk".to_string(),
            source: None,
        }
    }

    /// Register under a different node name (the step-context key).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_content_from(mut self, node: impl Into<String>, field: impl Into<String>) -> Self {
        self.source = Some((node.into(), field.into()));
        self
    }

    fn draft(&self, state: &WorkflowState) -> Option<String> {
        let from_context = self
            .source
            .as_ref()
            .and_then(|(node, field)| state.active_step_context.get_str(node, field));
        from_context
            .or_else(|| state.last_assistant_message().map(|m| m.content.as_str()))
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    }
}

impl Node for ApprovalAssessNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let draft = self
                .draft(&state)
                .ok_or_else(|| NodeError::recoverable("missing_content", "no draft to assess"))?;
            let thread_id = state
                .workflow_context
                .thread_id
                .clone()
                .unwrap_or_else(|| state.workflow_context.workflow_id.clone());

            let decision = self
                .manager
                .assess_and_submit(&thread_id, &draft)
                .await
                .map_err(|e| NodeError::recoverable("risk_assessment_failed", e.to_string()))?;

            let ctx = match &decision {
                ApprovalDecision::AutoApproved {
                    risk_score,
                    risk_level,
                } => ApprovalContext {
                    approval_id: None,
                    risk_level: *risk_level,
                    risk_score: *risk_score,
                    status: ApprovalStatus::Approved,
                    submitted_at: self.manager.now(),
                    expires_at: None,
                    escalated: false,
                    decision: None,
                },
                ApprovalDecision::Existing { request } | ApprovalDecision::Pending { request } => {
                    ApprovalContext {
                        approval_id: Some(request.id.clone()),
                        risk_level: request.risk_level,
                        risk_score: request.risk_score,
                        status: request.status,
                        submitted_at: request.submitted_at,
                        expires_at: Some(request.expires_at),
                        escalated: request.escalated,
                        decision: None,
                    }
                }
            };
            debug!(
                thread_id = %thread_id,
                status = %ctx.status,
                risk_level = %ctx.risk_level,
                "Draft assessed"
            );

            let summary = json!({
                "decision": serde_json::to_value(&decision)
                    .ok()
                    .and_then(|v| v.get("decision").cloned()),
                "risk_score": ctx.risk_score,
                "risk_level": ctx.risk_level,
                "approval_id": ctx.approval_id,
            });
            Ok(state
                .with_approval_context(ctx)
                .with_step_context(&self.name, summary))
        })
    }
}

/// Applies the reviewer decision carried in by a resume patch.
///
/// Marked interrupt-before in the graph, so it only runs on resume. If the
/// request already reached a terminal status (the deadline passed, or another
/// reviewer answered first) that stored status is recorded instead.
pub struct HumanApprovalNode {
    manager: ApprovalManager,
    name: String,
}

impl HumanApprovalNode {
    pub fn new(manager: ApprovalManager) -> Self {
        Self {
            manager,
            name: "human_approval".to_string(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl HumanApprovalNode {
    /// Resume without a decision: only valid once the request has already
    /// reached a terminal status, which is then recorded as-is.
    async fn settled_without_decision(
        &self,
        state: WorkflowState,
        mut ctx: ApprovalContext,
    ) -> NodeResult {
        let missing =
            || NodeError::recoverable("missing_decision", "resume carried no reviewer decision");
        let id = ctx.approval_id.clone().ok_or_else(missing)?;
        let stored = self
            .manager
            .check_expired(&id)
            .await
            .map_err(|e| NodeError::recoverable("approval_store", e.to_string()))?;
        if !stored.status.is_terminal() {
            return Err(missing());
        }

        debug!(approval_id = %id, status = %stored.status, "Gate resumed on a settled request");
        ctx.status = stored.status;
        ctx.expires_at = Some(stored.expires_at);
        ctx.escalated = stored.escalated;
        let summary = json!({ "status": ctx.status });
        Ok(state
            .with_approval_context(ctx)
            .with_step_context(&self.name, summary))
    }
}

impl Node for HumanApprovalNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let mut ctx = state.approval_context.clone().ok_or_else(|| {
                NodeError::recoverable("missing_decision", "no approval context in state")
            })?;
            let Some(decision) = ctx.decision.clone() else {
                return self.settled_without_decision(state, ctx).await;
            };
            let reviewer = decision
                .reviewer_id
                .clone()
                .unwrap_or_else(|| "anonymous".to_string());

            match ctx.approval_id.clone() {
                None => {
                    ctx.status = if decision.approved {
                        ApprovalStatus::Approved
                    } else {
                        ApprovalStatus::Rejected
                    };
                }
                Some(id) => {
                    let stored = match self
                        .manager
                        .on_decision(&id, decision.approved, &reviewer)
                        .await
                    {
                        Ok(request) => request,
                        Err(FlowgateError::InvalidStateTransition { from, .. }) => {
                            warn!(approval_id = %id, status = %from, "Decision arrived after resolution");
                            self.manager.get(&id).await.map_err(|e| {
                                NodeError::recoverable("approval_store", e.to_string())
                            })?
                        }
                        Err(e) => {
                            return Err(NodeError::recoverable("approval_store", e.to_string()))
                        }
                    };
                    ctx.status = stored.status;
                    ctx.expires_at = Some(stored.expires_at);
                    ctx.escalated = stored.escalated;
                }
            }

            let summary = json!({
                "status": ctx.status,
                "reviewer_id": reviewer,
                "comment": decision.comment,
            });
            Ok(state
                .with_approval_context(ctx)
                .with_step_context(&self.name, summary))
        })
    }
}
