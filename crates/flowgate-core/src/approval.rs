use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an approval request.
///
/// `Escalated` only appears in the audit trail: an escalated request is
/// stored as `Pending` with an extended deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Escalated,
}

impl ApprovalStatus {
    /// Approved, rejected and timeout are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "timeout" => Ok(Self::Timeout),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown approval status: {}", other)),
        }
    }
}

/// Risk tier derived from a score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a score against the configured thresholds.
    pub fn classify(score: f64, auto_approve: f64, high: f64, critical: f64) -> Self {
        if score >= critical {
            Self::Critical
        } else if score >= high {
            Self::High
        } else if score > auto_approve {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// A persisted human-approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub thread_id: String,
    pub content_hash: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub status: ApprovalStatus,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub escalated: bool,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_latency_ms: Option<i64>,
}

impl ApprovalRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at <= now
    }
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub reviewer_id: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub response_latency_ms: Option<i64>,
}

/// Append-only audit record of a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub approval_id: String,
    pub action: String,
    pub actor: String,
    pub previous_status: ApprovalStatus,
    pub new_status: ApprovalStatus,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of submitting content for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Risk was at or below the auto-approval threshold; nothing was persisted.
    AutoApproved { risk_score: f64, risk_level: RiskLevel },
    /// An identical pending request already exists.
    Existing { request: ApprovalRequest },
    /// A new request was created and awaits a reviewer.
    Pending { request: ApprovalRequest },
}

impl ApprovalDecision {
    pub fn request(&self) -> Option<&ApprovalRequest> {
        match self {
            Self::AutoApproved { .. } => None,
            Self::Existing { request } | Self::Pending { request } => Some(request),
        }
    }

    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::AutoApproved { .. } => ApprovalStatus::Approved,
            Self::Existing { request } | Self::Pending { request } => request.status,
        }
    }
}
