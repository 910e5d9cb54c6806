//! In-process stores for tests and storage-less deployments.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use flowgate_core::approval::{ApprovalRequest, ApprovalStatus, AuditEntry, Resolution};
use flowgate_core::checkpoint::Checkpoint;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{ApprovalRepository, CheckpointSaver};
use flowgate_core::types::ThreadId;

/// Checkpoint history kept in a map of per-thread vectors.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: Mutex<HashMap<ThreadId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointSaver for MemoryCheckpointStore {
    fn put(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            let history = threads.entry(checkpoint.thread_id.clone()).or_default();

            if history
                .iter()
                .any(|cp| cp.checkpoint_id == checkpoint.checkpoint_id)
            {
                return Err(FlowgateError::CheckpointConflict {
                    thread_id: checkpoint.thread_id.to_string(),
                    message: format!("duplicate checkpoint id {}", checkpoint.checkpoint_id),
                });
            }
            let head = history.last().map(|cp| cp.checkpoint_id.as_str());
            if checkpoint.parent_checkpoint_id.as_deref() != head {
                return Err(FlowgateError::CheckpointConflict {
                    thread_id: checkpoint.thread_id.to_string(),
                    message: format!(
                        "parent {:?} is not the current head {:?}",
                        checkpoint.parent_checkpoint_id, head
                    ),
                });
            }
            history.push(checkpoint);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        checkpoint_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move {
            let threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(history) = threads.get(thread_id) else {
                return Ok(None);
            };
            Ok(match checkpoint_id {
                Some(id) => history.iter().find(|cp| cp.checkpoint_id == id).cloned(),
                None => history.last().cloned(),
            })
        })
    }

    fn list<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            let threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(threads.get(thread_id).cloned().unwrap_or_default())
        })
    }
}

#[derive(Default)]
struct ApprovalTables {
    requests: HashMap<String, ApprovalRequest>,
    /// Insertion order, so listings are stable.
    order: Vec<String>,
    audit: Vec<AuditEntry>,
}

/// Approval repository behind a single mutex; status updates are atomic
/// because every read-compare-write happens under the lock.
#[derive(Default)]
pub struct MemoryApprovalRepository {
    tables: Mutex<ApprovalTables>,
}

impl MemoryApprovalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalRepository for MemoryApprovalRepository {
    fn insert(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            if tables.requests.contains_key(&request.id) {
                return Err(FlowgateError::Database(format!(
                    "approval request {} already exists",
                    request.id
                )));
            }
            tables.order.push(request.id.clone());
            tables.requests.insert(request.id.clone(), request);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<ApprovalRequest>>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(tables.requests.get(id).cloned())
        })
    }

    fn find_pending<'a>(
        &'a self,
        thread_id: &'a str,
        content_hash: &'a str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<ApprovalRequest>>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(tables
                .order
                .iter()
                .rev()
                .filter_map(|id| tables.requests.get(id))
                .find(|r| {
                    r.status == ApprovalStatus::Pending
                        && r.thread_id == thread_id
                        && r.content_hash == content_hash
                        && r.submitted_at >= since
                })
                .cloned())
        })
    }

    fn list_pending<'a>(
        &'a self,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<ApprovalRequest>>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(tables
                .order
                .iter()
                .filter_map(|id| tables.requests.get(id))
                .filter(|r| r.status == ApprovalStatus::Pending)
                .filter(|r| thread_id.map_or(true, |t| r.thread_id == t))
                .cloned()
                .collect())
        })
    }

    fn compare_and_set_status<'a>(
        &'a self,
        id: &'a str,
        expected: ApprovalStatus,
        new: ApprovalStatus,
        resolution: Resolution,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(request) = tables.requests.get_mut(id) else {
                return Err(FlowgateError::ApprovalNotFound(id.to_string()));
            };
            if request.status != expected {
                return Ok(false);
            }
            request.status = new;
            request.reviewer_id = resolution.reviewer_id;
            request.resolved_at = resolution.resolved_at;
            request.response_latency_ms = resolution.response_latency_ms;
            Ok(true)
        })
    }

    fn extend_expiry<'a>(
        &'a self,
        id: &'a str,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(request) = tables.requests.get_mut(id) else {
                return Err(FlowgateError::ApprovalNotFound(id.to_string()));
            };
            if request.status != ApprovalStatus::Pending {
                return Ok(false);
            }
            request.expires_at = expires_at;
            request.escalated = true;
            Ok(true)
        })
    }

    fn append_audit(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            tables.audit.push(entry);
            Ok(())
        })
    }

    fn audit_trail<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<AuditEntry>>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(tables
                .audit
                .iter()
                .filter(|e| e.approval_id == id)
                .cloned()
                .collect())
        })
    }
}
