use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::approval::{ApprovalRequest, ApprovalStatus, AuditEntry, Resolution};
use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::types::ThreadId;

/// Checkpoint store: durable, append-only history of state snapshots.
pub trait CheckpointSaver: Send + Sync + 'static {
    /// Append a checkpoint. Fails with `CheckpointConflict` if the id already
    /// exists or the parent is not the thread's current head.
    fn put(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Load a specific checkpoint, or the latest one when `checkpoint_id` is `None`.
    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        checkpoint_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>>>;

    /// Full history for a thread, oldest first.
    fn list<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<Vec<Checkpoint>>>;
}

/// Approval persistence: the source of truth for approval requests.
pub trait ApprovalRepository: Send + Sync + 'static {
    fn insert(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<ApprovalRequest>>>;

    /// Pending request for `thread_id` with `content_hash`, submitted at or after `since`.
    fn find_pending<'a>(
        &'a self,
        thread_id: &'a str,
        content_hash: &'a str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<ApprovalRequest>>>;

    /// All pending requests, optionally limited to one thread.
    fn list_pending<'a>(
        &'a self,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<ApprovalRequest>>>;

    /// Atomically move `id` from `expected` to `new`. Returns `false` without
    /// writing anything when the stored status is not `expected`.
    fn compare_and_set_status<'a>(
        &'a self,
        id: &'a str,
        expected: ApprovalStatus,
        new: ApprovalStatus,
        resolution: Resolution,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Move the deadline of a pending request and flag it escalated.
    /// Returns `false` when the request is no longer pending.
    fn extend_expiry<'a>(
        &'a self,
        id: &'a str,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>>;

    fn append_audit(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>>;

    fn audit_trail<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<AuditEntry>>>;
}

/// Risk scoring: returns a score in [0, 1] for candidate content.
pub trait RiskScorer: Send + Sync + 'static {
    fn score<'a>(&'a self, content: &'a str) -> BoxFuture<'a, Result<f64>>;
}

/// Time source, injected so deadlines can be tested.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
