use crate::approval::ApprovalStatus;
use crate::checkpoint::RunStatus;
use crate::types::ThreadId;

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Invocation (or resume) started.
    RunStarted { thread_id: ThreadId, resumed: bool },
    /// A node is about to execute.
    NodeStarted { thread_id: ThreadId, node: String },
    /// A node finished and its checkpoint was written.
    NodeCompleted {
        thread_id: ThreadId,
        node: String,
        elapsed_ms: u64,
    },
    /// A node failed; the error was recorded in the state.
    NodeFailed {
        thread_id: ThreadId,
        node: String,
        code: String,
        recoverable: bool,
    },
    /// Execution paused at an interrupt.
    Interrupted { thread_id: ThreadId, node: String },
    /// Invocation returned with a final status.
    RunFinished { thread_id: ThreadId, status: RunStatus },
    /// A new approval request is waiting for a reviewer.
    ApprovalRequested {
        approval_id: String,
        thread_id: String,
        escalated: bool,
    },
    /// An approval request reached a terminal status.
    ApprovalResolved {
        approval_id: String,
        status: ApprovalStatus,
    },
    /// An approval request was escalated and its deadline extended.
    ApprovalEscalated { approval_id: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
