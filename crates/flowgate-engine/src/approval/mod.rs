//! Human-approval gate: risk routing, deadlines, escalation and the graph
//! nodes that interrupt into it.

mod manager;
mod nodes;
mod risk;

pub use manager::ApprovalManager;
pub use nodes::{approval_route, ApprovalAssessNode, HumanApprovalNode, SENSITIVE, SIMPLE};
pub use risk::{content_hash, KeywordRiskScorer};
