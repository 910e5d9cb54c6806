use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowgateError, Result};
use crate::state::WorkflowState;
use crate::types::ThreadId;

/// Run state of an invocation, as recorded on each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    PausedInterrupt,
    Completed,
    Failed,
    Cancelled,
    /// Paused at an approval gate whose deadline has passed. Reported by
    /// status queries; the engine never writes it to a checkpoint.
    Timeout,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PausedInterrupt => "paused_interrupt",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a node an interrupt paused on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Before,
    After,
}

/// Bookkeeping stored next to each state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub status: RunStatus,
    /// Node this checkpoint was taken at.
    pub node: String,
    /// Step count of the invocation when the checkpoint was taken.
    pub step: usize,
    /// Whether this checkpoint records a successful execution of `node`.
    pub node_completed: bool,
    /// Node to execute when resuming from here. `None` means route from `node`.
    #[serde(default)]
    pub resume_node: Option<String>,
    #[serde(default)]
    pub interrupt: Option<InterruptKind>,
}

/// Immutable snapshot of the state after one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub state: WorkflowState,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        thread_id: ThreadId,
        parent_checkpoint_id: Option<String>,
        state: WorkflowState,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            thread_id,
            checkpoint_id: Uuid::new_v4().to_string(),
            parent_checkpoint_id,
            state,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn resumable(&self) -> bool {
        self.state.workflow_context.resumable
    }
}

/// Check that `history` (oldest first) forms a single linked chain.
pub fn verify_chain(history: &[Checkpoint]) -> Result<()> {
    let mut previous: Option<&Checkpoint> = None;
    for cp in history {
        let expected = previous.map(|p| p.checkpoint_id.as_str());
        if cp.parent_checkpoint_id.as_deref() != expected {
            return Err(FlowgateError::CheckpointConflict {
                thread_id: cp.thread_id.to_string(),
                message: format!(
                    "checkpoint {} has parent {:?}, expected {:?}",
                    cp.checkpoint_id, cp.parent_checkpoint_id, expected
                ),
            });
        }
        if let Some(p) = previous {
            if p.thread_id != cp.thread_id {
                return Err(FlowgateError::CheckpointConflict {
                    thread_id: cp.thread_id.to_string(),
                    message: format!("checkpoint {} belongs to another thread", cp.checkpoint_id),
                });
            }
        }
        previous = Some(cp);
    }
    Ok(())
}

/// Rebuild the completed-step list by replaying checkpoints in order.
///
/// Exactly one checkpoint is written per successful node execution; pause,
/// failure and cancellation boundaries are not counted.
pub fn replay_completed_steps(history: &[Checkpoint]) -> Vec<String> {
    history
        .iter()
        .filter(|cp| cp.metadata.node_completed)
        .map(|cp| cp.metadata.node.clone())
        .collect()
}
