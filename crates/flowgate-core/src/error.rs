use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowgateError {
    // Graph definition errors
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    // Execution errors
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Thread is not resumable: {0}")]
    ThreadNotResumable(String),

    #[error("Exceeded max steps ({0}) in a single invocation")]
    MaxStepsExceeded(usize),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Checkpoint errors
    #[error("Checkpoint conflict on thread {thread_id}: {message}")]
    CheckpointConflict { thread_id: String, message: String },

    // Approval errors
    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid approval transition for {approval_id}: {from} -> {to}")]
    InvalidStateTransition {
        approval_id: String,
        from: String,
        to: String,
    },

    #[error("Risk scoring failed: {0}")]
    RiskScoring(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowgateError>;
