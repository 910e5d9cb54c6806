pub mod approval;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod pipeline;
pub mod service;

pub use approval::{ApprovalAssessNode, ApprovalManager, HumanApprovalNode, KeywordRiskScorer};
pub use executor::{ApprovalSummary, ExecutionEngine, RunOutcome, ThreadStatus};
pub use graph::{node_fn, CompiledGraph, GraphBuilder, Node, NodeResult, ERROR_HANDLER};
pub use memory::{MemoryApprovalRepository, MemoryCheckpointStore};
pub use service::WorkflowService;
