use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        checkpoint_id TEXT NOT NULL UNIQUE,
        thread_id TEXT NOT NULL,
        parent_checkpoint_id TEXT,
        state TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
        ON checkpoints(thread_id, seq);

    CREATE TABLE IF NOT EXISTS approval_requests (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        risk_level TEXT NOT NULL,
        risk_score REAL NOT NULL,
        status TEXT NOT NULL,
        submitted_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        escalated INTEGER NOT NULL DEFAULT 0,
        reviewer_id TEXT,
        resolved_at TEXT,
        response_latency_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_approvals_pending
        ON approval_requests(status, thread_id, content_hash);

    CREATE TABLE IF NOT EXISTS approval_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        approval_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        previous_status TEXT NOT NULL,
        new_status TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_approval
        ON approval_audit(approval_id, id);
";

pub(crate) fn db_err(e: impl std::fmt::Display) -> FlowgateError {
    FlowgateError::Database(e.to_string())
}

/// Open (or create) a database file and make sure the schema exists.
pub(crate) fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
    }
    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
        .map_err(db_err)?;
    conn.execute_batch(SCHEMA).map_err(db_err)?;
    debug!(path = %path.display(), "SQLite database opened");
    Ok(conn)
}

pub(crate) fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(db_err)?;
    conn.execute_batch(SCHEMA).map_err(db_err)?;
    Ok(conn)
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort correctly.
pub(crate) fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_text(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| db_err(format!("bad timestamp '{}': {}", s, e)))
}
