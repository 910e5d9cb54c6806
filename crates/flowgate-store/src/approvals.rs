use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowgate_core::approval::{ApprovalRequest, ApprovalStatus, AuditEntry, Resolution};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::ApprovalRepository;

use crate::schema::{self, db_err, from_text, to_text};

/// Approval requests and their audit trail.
///
/// Status changes are single `UPDATE ... WHERE status = ?` statements, so a
/// timer and a reviewer racing on the same request cannot both win, even
/// across processes sharing the file.
pub struct SqliteApprovalRepository {
    conn: Mutex<Connection>,
}

impl SqliteApprovalRepository {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open_in_memory()?),
        })
    }
}

const REQUEST_COLUMNS: &str = "id, thread_id, content_hash, risk_level, risk_score, status, \
     submitted_at, expires_at, escalated, reviewer_id, resolved_at, response_latency_ms";

struct RawRequest {
    id: String,
    thread_id: String,
    content_hash: String,
    risk_level: String,
    risk_score: f64,
    status: String,
    submitted_at: String,
    expires_at: String,
    escalated: bool,
    reviewer_id: Option<String>,
    resolved_at: Option<String>,
    response_latency_ms: Option<i64>,
}

impl RawRequest {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            content_hash: row.get(2)?,
            risk_level: row.get(3)?,
            risk_score: row.get(4)?,
            status: row.get(5)?,
            submitted_at: row.get(6)?,
            expires_at: row.get(7)?,
            escalated: row.get(8)?,
            reviewer_id: row.get(9)?,
            resolved_at: row.get(10)?,
            response_latency_ms: row.get(11)?,
        })
    }

    fn decode(self) -> Result<ApprovalRequest> {
        Ok(ApprovalRequest {
            risk_level: self.risk_level.parse().map_err(db_err)?,
            status: parse_status(&self.status)?,
            submitted_at: from_text(&self.submitted_at)?,
            expires_at: from_text(&self.expires_at)?,
            resolved_at: self.resolved_at.as_deref().map(from_text).transpose()?,
            id: self.id,
            thread_id: self.thread_id,
            content_hash: self.content_hash,
            risk_score: self.risk_score,
            escalated: self.escalated,
            reviewer_id: self.reviewer_id,
            response_latency_ms: self.response_latency_ms,
        })
    }
}

fn parse_status(s: &str) -> Result<ApprovalStatus> {
    s.parse().map_err(db_err)
}

fn query_requests(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ApprovalRequest>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt.query_map(params, RawRequest::from_row).map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(db_err)?.decode()?);
    }
    Ok(out)
}

fn exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM approval_requests WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
    .map_err(db_err)
}

impl ApprovalRepository for SqliteApprovalRepository {
    fn insert(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                &format!(
                    "INSERT INTO approval_requests ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    REQUEST_COLUMNS
                ),
                params![
                    request.id,
                    request.thread_id,
                    request.content_hash,
                    request.risk_level.to_string(),
                    request.risk_score,
                    request.status.as_str(),
                    to_text(request.submitted_at),
                    to_text(request.expires_at),
                    request.escalated,
                    request.reviewer_id,
                    request.resolved_at.map(to_text),
                    request.response_latency_ms,
                ],
            )
            .map_err(db_err)?;
            debug!(approval_id = %request.id, thread_id = %request.thread_id, "Approval request stored");
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.query_row(
                &format!("SELECT {} FROM approval_requests WHERE id = ?1", REQUEST_COLUMNS),
                params![id],
                RawRequest::from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(RawRequest::decode)
            .transpose()
        })
    }

    fn find_pending<'a>(
        &'a self,
        thread_id: &'a str,
        content_hash: &'a str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut matches = query_requests(
                &conn,
                &format!(
                    "SELECT {} FROM approval_requests
                     WHERE status = 'pending' AND thread_id = ?1 AND content_hash = ?2
                       AND submitted_at >= ?3
                     ORDER BY rowid DESC LIMIT 1",
                    REQUEST_COLUMNS
                ),
                params![thread_id, content_hash, to_text(since)],
            )?;
            Ok(matches.pop())
        })
    }

    fn list_pending<'a>(
        &'a self,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            match thread_id {
                Some(thread_id) => query_requests(
                    &conn,
                    &format!(
                        "SELECT {} FROM approval_requests
                         WHERE status = 'pending' AND thread_id = ?1 ORDER BY rowid",
                        REQUEST_COLUMNS
                    ),
                    params![thread_id],
                ),
                None => query_requests(
                    &conn,
                    &format!(
                        "SELECT {} FROM approval_requests WHERE status = 'pending' ORDER BY rowid",
                        REQUEST_COLUMNS
                    ),
                    [],
                ),
            }
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
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE approval_requests
                     SET status = ?3, reviewer_id = ?4, resolved_at = ?5, response_latency_ms = ?6
                     WHERE id = ?1 AND status = ?2",
                    params![
                        id,
                        expected.as_str(),
                        new.as_str(),
                        resolution.reviewer_id,
                        resolution.resolved_at.map(to_text),
                        resolution.response_latency_ms,
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 && !exists(&conn, id)? {
                return Err(FlowgateError::ApprovalNotFound(id.to_string()));
            }
            Ok(changed == 1)
        })
    }

    fn extend_expiry<'a>(
        &'a self,
        id: &'a str,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE approval_requests SET expires_at = ?2, escalated = 1
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, to_text(expires_at)],
                )
                .map_err(db_err)?;
            if changed == 0 && !exists(&conn, id)? {
                return Err(FlowgateError::ApprovalNotFound(id.to_string()));
            }
            Ok(changed == 1)
        })
    }

    fn append_audit(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO approval_audit
                    (approval_id, action, actor, previous_status, new_status, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.approval_id,
                    entry.action,
                    entry.actor,
                    entry.previous_status.as_str(),
                    entry.new_status.as_str(),
                    to_text(entry.timestamp),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn audit_trail<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<AuditEntry>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT approval_id, action, actor, previous_status, new_status, timestamp
                     FROM approval_audit WHERE approval_id = ?1 ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?;

            let mut trail = Vec::new();
            for row in rows {
                let (approval_id, action, actor, previous, new, timestamp) =
                    row.map_err(db_err)?;
                trail.push(AuditEntry {
                    approval_id,
                    action,
                    actor,
                    previous_status: parse_status(&previous)?,
                    new_status: parse_status(&new)?,
                    timestamp: from_text(&timestamp)?,
                });
            }
            Ok(trail)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::{fixed_epoch, pending_request};

    #[tokio::test]
    async fn insert_get_and_list_pending() {
        let repo = SqliteApprovalRepository::in_memory().unwrap();
        let now = fixed_epoch();
        repo.insert(pending_request("a1", "t1", now)).await.unwrap();
        repo.insert(pending_request("a2", "t2", now)).await.unwrap();

        let a1 = repo.get("a1").await.unwrap().unwrap();
        assert_eq!(a1, pending_request("a1", "t1", now));
        assert!(repo.get("nope").await.unwrap().is_none());

        assert_eq!(repo.list_pending(None).await.unwrap().len(), 2);
        let t2 = repo.list_pending(Some("t2")).await.unwrap();
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].id, "a2");

        assert!(repo.insert(pending_request("a1", "t1", now)).await.is_err());
    }

    #[tokio::test]
    async fn find_pending_respects_window() {
        let repo = SqliteApprovalRepository::in_memory().unwrap();
        let now = fixed_epoch();
        let mut req = pending_request("a1", "t1", now);
        req.content_hash = "h".into();
        repo.insert(req).await.unwrap();

        let hit = repo
            .find_pending("t1", "h", now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(hit.map(|r| r.id), Some("a1".to_string()));
        assert!(repo
            .find_pending("t1", "h", now + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_pending("t1", "other", now - chrono::Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn compare_and_set_only_moves_expected_status() {
        let repo = SqliteApprovalRepository::in_memory().unwrap();
        let now = fixed_epoch();
        repo.insert(pending_request("a1", "t1", now)).await.unwrap();

        let resolution = Resolution {
            reviewer_id: Some("rev".into()),
            resolved_at: Some(now),
            response_latency_ms: Some(42),
        };
        assert!(repo
            .compare_and_set_status("a1", ApprovalStatus::Pending, ApprovalStatus::Approved, resolution.clone())
            .await
            .unwrap());
        assert!(!repo
            .compare_and_set_status("a1", ApprovalStatus::Pending, ApprovalStatus::Timeout, Resolution::default())
            .await
            .unwrap());

        let stored = repo.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.reviewer_id.as_deref(), Some("rev"));
        assert_eq!(stored.response_latency_ms, Some(42));
        assert!(repo.list_pending(None).await.unwrap().is_empty());

        assert!(matches!(
            repo.compare_and_set_status("ghost", ApprovalStatus::Pending, ApprovalStatus::Approved, resolution)
                .await,
            Err(FlowgateError::ApprovalNotFound(_))
        ));
    }

    #[tokio::test]
    async fn extend_expiry_flags_escalation() {
        let repo = SqliteApprovalRepository::in_memory().unwrap();
        let now = fixed_epoch();
        repo.insert(pending_request("a1", "t1", now)).await.unwrap();
        let later = now + chrono::Duration::hours(1);

        assert!(repo.extend_expiry("a1", later).await.unwrap());
        let stored = repo.get("a1").await.unwrap().unwrap();
        assert!(stored.escalated);
        assert_eq!(stored.expires_at, later);

        repo.compare_and_set_status("a1", ApprovalStatus::Pending, ApprovalStatus::Rejected, Resolution::default())
            .await
            .unwrap();
        assert!(!repo.extend_expiry("a1", later).await.unwrap());
    }

    #[tokio::test]
    async fn audit_trail_is_ordered() {
        let repo = SqliteApprovalRepository::in_memory().unwrap();
        let now = fixed_epoch();
        for (action, prev, new) in [
            ("submit", ApprovalStatus::Pending, ApprovalStatus::Pending),
            ("escalate", ApprovalStatus::Pending, ApprovalStatus::Escalated),
            ("approve", ApprovalStatus::Pending, ApprovalStatus::Approved),
        ] {
            repo.append_audit(AuditEntry {
                approval_id: "a1".into(),
                action: action.into(),
                actor: "tester".into(),
                previous_status: prev,
                new_status: new,
                timestamp: now,
            })
            .await
            .unwrap();
        }
        let trail = repo.audit_trail("a1").await.unwrap();
        let actions: Vec<_> = trail.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["submit", "escalate", "approve"]);
        assert_eq!(trail[1].new_status, ApprovalStatus::Escalated);
        assert!(repo.audit_trail("other").await.unwrap().is_empty());
    }
}
