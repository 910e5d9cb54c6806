use std::sync::Arc;

use tracing::{info, warn};

use flowgate_core::approval::{ApprovalRequest, ApprovalStatus};
use flowgate_core::checkpoint::{Checkpoint, InterruptKind, RunStatus};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::state::{StatePatch, WorkflowState};
use flowgate_core::types::{Message, ThreadId};

use crate::approval::ApprovalManager;
use crate::executor::{ExecutionEngine, RunOutcome, ThreadStatus};

/// Actor recorded when cancelling a thread rejects its open request.
const CANCEL_ACTOR: &str = "system:cancelled";

/// Facade over the engine and the approval manager.
///
/// The HTTP gateway and the CLI talk to this type only.
#[derive(Clone)]
pub struct WorkflowService {
    engine: Arc<ExecutionEngine>,
    approvals: ApprovalManager,
}

impl WorkflowService {
    pub fn new(engine: Arc<ExecutionEngine>, approvals: ApprovalManager) -> Self {
        Self { engine, approvals }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    /// Run the graph for a new user turn.
    ///
    /// Without `thread_id` a new thread is started. For an existing thread the
    /// conversation and its step history carry over and the message is
    /// appended as the next user turn. `metadata` entries are attached to the
    /// user message.
    pub async fn execute(
        &self,
        message: &str,
        thread_id: Option<ThreadId>,
        metadata: Option<serde_json::Value>,
    ) -> Result<RunOutcome> {
        if message.trim().is_empty() {
            return Err(FlowgateError::InvalidState("message must not be empty".into()));
        }

        let mut user = Message::user(message);
        match metadata {
            Some(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    user = user.with_meta(key, value);
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(_) => {
                return Err(FlowgateError::InvalidState("metadata must be a JSON object".into()))
            }
        }

        let thread_id = thread_id.unwrap_or_default();
        let previous = self.engine.checkpoints().get(&thread_id, None).await?;
        let state = match previous {
            Some(cp) => {
                let mut state = WorkflowState::new();
                state.messages = cp.state.messages;
                state.workflow_context = cp.state.workflow_context;
                state.errors = cp.state.errors;
                state.with_message(user)
            }
            None => WorkflowState::new().with_message(user),
        };
        self.engine.invoke(state, thread_id).await
    }

    /// Thread summary, with any open approval checked against its deadline.
    pub async fn status(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        let mut status = self.engine.status(thread_id).await?;
        let Some(summary) = status.approval.as_mut() else {
            return Ok(status);
        };
        let Some(id) = summary.approval_id.clone() else {
            return Ok(status);
        };
        if summary.status != ApprovalStatus::Pending {
            return Ok(status);
        }
        match self.approvals.check_expired(&id).await {
            Ok(request) => {
                summary.status = request.status;
                summary.expires_at = Some(request.expires_at);
                summary.escalated = request.escalated;
                if request.status == ApprovalStatus::Timeout
                    && status.status == RunStatus::PausedInterrupt
                {
                    status.status = RunStatus::Timeout;
                }
            }
            Err(FlowgateError::ApprovalNotFound(_)) => {
                warn!(thread_id = %thread_id, approval_id = %id, "Approval missing from repository");
            }
            Err(e) => return Err(e),
        }
        Ok(status)
    }

    /// Resume a paused thread.
    ///
    /// A thread waiting at an approval gate whose request is still pending
    /// needs a decision in `patch`; without one the call fails with
    /// `InvalidState` and nothing is touched.
    pub async fn resume(&self, thread_id: &ThreadId, patch: StatePatch) -> Result<RunOutcome> {
        if !patch.carries_decision() {
            if let Some(id) = self.open_gate(thread_id).await? {
                let request = self.approvals.check_expired(&id).await?;
                if request.status == ApprovalStatus::Pending {
                    return Err(FlowgateError::InvalidState(format!(
                        "thread {} is waiting on approval {}; resume needs approved and reviewer_id",
                        thread_id, id
                    )));
                }
            }
        }
        self.engine.resume(thread_id, patch).await
    }

    /// Approval id the thread is paused on, if it sits before a gate with an
    /// unresolved request.
    async fn open_gate(&self, thread_id: &ThreadId) -> Result<Option<String>> {
        let Some(latest) = self.engine.checkpoints().get(thread_id, None).await? else {
            return Ok(None);
        };
        if latest.metadata.status != RunStatus::PausedInterrupt
            || latest.metadata.interrupt != Some(InterruptKind::Before)
        {
            return Ok(None);
        }
        Ok(latest
            .state
            .approval_context
            .filter(|ctx| ctx.status == ApprovalStatus::Pending)
            .and_then(|ctx| ctx.approval_id))
    }

    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        self.engine.history(thread_id).await
    }

    /// Cancel a thread and reject any approval it is still waiting on.
    pub async fn cancel(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        let status = self.engine.cancel(thread_id).await?;
        if status.status != RunStatus::Cancelled {
            return Ok(status);
        }
        for request in self.approvals.pending_for_thread(thread_id.as_str()).await? {
            match self.approvals.on_decision(&request.id, false, CANCEL_ACTOR).await {
                Ok(_) | Err(FlowgateError::InvalidStateTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(status)
    }

    /// Apply a reviewer decision and resume the thread that is waiting on it.
    ///
    /// Fails with `InvalidStateTransition` if the request is no longer
    /// pending, including when its deadline has just passed.
    pub async fn decide(
        &self,
        approval_id: &str,
        approved: bool,
        reviewer_id: &str,
        comment: Option<String>,
    ) -> Result<RunOutcome> {
        let request = self.approvals.check_expired(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            let to = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            return Err(FlowgateError::InvalidStateTransition {
                approval_id: approval_id.to_string(),
                from: request.status.to_string(),
                to: to.to_string(),
            });
        }

        info!(approval_id, thread_id = %request.thread_id, approved, reviewer_id, "Reviewer decision received");
        let patch = StatePatch {
            comment,
            ..StatePatch::decision(approved, reviewer_id)
        };
        self.engine
            .resume(&ThreadId::from_string(&request.thread_id), patch)
            .await
    }

    pub async fn escalate(&self, approval_id: &str, actor: &str) -> Result<ApprovalRequest> {
        self.approvals.escalate(approval_id, actor).await
    }

    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        self.approvals.pending().await
    }
}
