//! The workflow state threaded through the graph.
//!
//! A node receives a `WorkflowState` and returns a new one. Field ownership:
//!
//! - `messages` and `errors` are append-only.
//! - `active_step_context` holds one entry per node, keyed by node name; a
//!   node may only write its own entry.
//! - `workflow_context` and `execution_metadata` belong to the engine.
//! - `approval_context` is written by the approval nodes and by resume patches.
//!
//! `check_ownership` enforces these rules on every node output and `merge`
//! is the only way external input enters a stored state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalStatus, RiskLevel};
use crate::types::{Message, Role};

/// Per-node context produced by the most recently executed nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepContext {
    data: BTreeMap<String, serde_json::Value>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, node: &str) -> Option<&serde_json::Value> {
        self.data.get(node)
    }

    /// Read a string field out of a node's entry.
    pub fn get_str(&self, node: &str, field: &str) -> Option<&str> {
        self.data
            .get(node)
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
    }

    pub fn set(&mut self, node: impl Into<String>, value: serde_json::Value) {
        self.data.insert(node.into(), value);
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: BTreeMap<String, serde_json::Value>) {
        for (k, v) in other {
            self.data.insert(k, v);
        }
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}

/// One routing decision: `from` routed to `to` through `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub from: String,
    pub label: String,
    pub to: String,
}

/// Engine-owned bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: String,
    /// Thread the current run is checkpointed under.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub branch_history: Vec<BranchRecord>,
    #[serde(default = "default_resumable")]
    pub resumable: bool,
    #[serde(default)]
    pub cancel_requested: bool,
}

fn default_resumable() -> bool {
    true
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            thread_id: None,
            current_step: None,
            completed_steps: Vec::new(),
            branch_history: Vec::new(),
            resumable: true,
            cancel_requested: false,
        }
    }
}

/// A reviewer's answer carried into the state by a resume patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Approval gate bookkeeping for the current draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalContext {
    /// `None` when the content was auto-approved and nothing was persisted.
    #[serde(default)]
    pub approval_id: Option<String>,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub status: ApprovalStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub decision: Option<ReviewDecision>,
}

impl ApprovalContext {
    /// Context for a decision that arrived without a prior assessment.
    fn detached(decision: ReviewDecision) -> Self {
        Self {
            approval_id: None,
            risk_level: RiskLevel::Low,
            risk_score: 0.0,
            status: ApprovalStatus::Pending,
            submitted_at: Utc::now(),
            expires_at: None,
            escalated: false,
            decision: Some(decision),
        }
    }
}

/// A recorded execution error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub step: String,
    pub recoverable: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl StepError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        step: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            step: step.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }
}

/// Engine-owned execution counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub step_count: usize,
    #[serde(default)]
    pub node_executions: BTreeMap<String, u32>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            step_count: 0,
            node_executions: BTreeMap::new(),
        }
    }
}

/// The single value threaded through the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub active_step_context: StepContext,
    #[serde(default)]
    pub workflow_context: WorkflowContext,
    #[serde(default)]
    pub approval_context: Option<ApprovalContext>,
    #[serde(default)]
    pub errors: Vec<StepError>,
    #[serde(default)]
    pub execution_metadata: ExecutionMetadata,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a state from the user's first turn.
    pub fn from_user_message(content: impl Into<String>) -> Self {
        Self::new().with_message(Message::user(content))
    }

    /// Return a copy with one more message appended.
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Return a copy with this node's step-context entry replaced.
    pub fn with_step_context(mut self, node: &str, value: serde_json::Value) -> Self {
        self.active_step_context.set(node, value);
        self
    }

    pub fn with_approval_context(mut self, ctx: ApprovalContext) -> Self {
        self.approval_context = Some(ctx);
        self
    }

    pub fn latest_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The most recent user turn.
    pub fn user_query(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// The most recent assistant turn.
    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| !e.recoverable)
    }

    pub fn approval_status(&self) -> Option<ApprovalStatus> {
        self.approval_context.as_ref().map(|a| a.status)
    }

    /// Apply an external patch, producing a new state.
    ///
    /// Messages are appended, step-context entries are replaced per key,
    /// a present `approval_context` replaces the existing one, and a review
    /// decision is recorded on the approval context. Engine-owned fields are
    /// never taken from the patch, except the cancellation flag.
    pub fn merge(&self, patch: StatePatch) -> WorkflowState {
        let mut next = self.clone();
        next.messages.extend(patch.messages);
        next.active_step_context.merge(patch.active_step_context);

        if let Some(ctx) = patch.approval_context {
            next.approval_context = Some(ctx);
        }

        if let Some(approved) = patch.approved {
            let decision = ReviewDecision {
                approved,
                reviewer_id: patch.reviewer_id,
                comment: patch.comment,
            };
            match next.approval_context.as_mut() {
                Some(ctx) => ctx.decision = Some(decision),
                None => next.approval_context = Some(ApprovalContext::detached(decision)),
            }
        }

        if patch.cancel.unwrap_or(false) {
            next.workflow_context.cancel_requested = true;
        }
        next
    }

    /// Verify that `after`, produced by `node` from `self`, only touched
    /// fields the node owns.
    pub fn check_ownership(&self, after: &WorkflowState, node: &str) -> Result<(), String> {
        if after.messages.len() < self.messages.len()
            || after.messages[..self.messages.len()] != self.messages[..]
        {
            return Err(format!("node '{}' rewrote earlier messages", node));
        }

        if after.errors.len() < self.errors.len()
            || after.errors[..self.errors.len()] != self.errors[..]
        {
            return Err(format!("node '{}' rewrote recorded errors", node));
        }

        if after.workflow_context != self.workflow_context {
            return Err(format!("node '{}' modified workflow_context", node));
        }

        if after.execution_metadata != self.execution_metadata {
            return Err(format!("node '{}' modified execution_metadata", node));
        }

        let before_ctx = self.active_step_context.data();
        let after_ctx = after.active_step_context.data();
        for key in before_ctx.keys().chain(after_ctx.keys()) {
            if key == node {
                continue;
            }
            if before_ctx.get(key) != after_ctx.get(key) {
                return Err(format!(
                    "node '{}' modified step context owned by '{}'",
                    node, key
                ));
            }
        }

        Ok(())
    }
}

/// External input merged into a stored state on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatePatch {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub active_step_context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub approval_context: Option<ApprovalContext>,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub cancel: Option<bool>,
}

impl StatePatch {
    /// A reviewer decision.
    pub fn decision(approved: bool, reviewer_id: impl Into<String>) -> Self {
        Self {
            approved: Some(approved),
            reviewer_id: Some(reviewer_id.into()),
            ..Self::default()
        }
    }

    /// Whether merging this patch leaves a reviewer decision in the state.
    pub fn carries_decision(&self) -> bool {
        self.approved.is_some()
            || self
                .approval_context
                .as_ref()
                .is_some_and(|ctx| ctx.decision.is_some())
    }
}
