use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use flowgate_core::checkpoint::Checkpoint;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::CheckpointSaver;
use flowgate_core::types::ThreadId;

use crate::schema::{self, db_err, from_text, to_text};

/// Append-only checkpoint history in the `checkpoints` table.
///
/// Rows are ordered by an autoincrement sequence; the head of a thread is
/// its highest sequence number.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
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

struct RawCheckpoint {
    thread_id: String,
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    state: String,
    metadata: String,
    created_at: String,
}

impl RawCheckpoint {
    const COLUMNS: &'static str =
        "thread_id, checkpoint_id, parent_checkpoint_id, state, metadata, created_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get(0)?,
            checkpoint_id: row.get(1)?,
            parent_checkpoint_id: row.get(2)?,
            state: row.get(3)?,
            metadata: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            thread_id: ThreadId(self.thread_id),
            checkpoint_id: self.checkpoint_id,
            parent_checkpoint_id: self.parent_checkpoint_id,
            state: serde_json::from_str(&self.state)?,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: from_text(&self.created_at)?,
        })
    }
}

impl CheckpointSaver for SqliteCheckpointStore {
    fn put(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let state = serde_json::to_string(&checkpoint.state)?;
            let metadata = serde_json::to_string(&checkpoint.metadata)?;
            let thread_id = checkpoint.thread_id.as_str();

            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM checkpoints WHERE checkpoint_id = ?1)",
                    params![checkpoint.checkpoint_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if exists {
                return Err(FlowgateError::CheckpointConflict {
                    thread_id: thread_id.to_string(),
                    message: format!("duplicate checkpoint id {}", checkpoint.checkpoint_id),
                });
            }

            let head: Option<String> = tx
                .query_row(
                    "SELECT checkpoint_id FROM checkpoints
                     WHERE thread_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if checkpoint.parent_checkpoint_id != head {
                return Err(FlowgateError::CheckpointConflict {
                    thread_id: thread_id.to_string(),
                    message: format!(
                        "parent {:?} is not the current head {:?}",
                        checkpoint.parent_checkpoint_id, head
                    ),
                });
            }

            tx.execute(
                "INSERT INTO checkpoints
                    (checkpoint_id, thread_id, parent_checkpoint_id, state, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.checkpoint_id,
                    thread_id,
                    checkpoint.parent_checkpoint_id,
                    state,
                    metadata,
                    to_text(checkpoint.created_at),
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            debug!(
                thread_id,
                checkpoint_id = %checkpoint.checkpoint_id,
                node = %checkpoint.metadata.node,
                "Checkpoint persisted"
            );
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        checkpoint_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let raw = match checkpoint_id {
                Some(id) => conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                            RawCheckpoint::COLUMNS
                        ),
                        params![thread_id.as_str(), id],
                        RawCheckpoint::from_row,
                    )
                    .optional(),
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM checkpoints WHERE thread_id = ?1
                             ORDER BY seq DESC LIMIT 1",
                            RawCheckpoint::COLUMNS
                        ),
                        params![thread_id.as_str()],
                        RawCheckpoint::from_row,
                    )
                    .optional(),
            }
            .map_err(db_err)?;
            raw.map(RawCheckpoint::decode).transpose()
        })
    }

    fn list<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE thread_id = ?1 ORDER BY seq ASC",
                    RawCheckpoint::COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![thread_id.as_str()], RawCheckpoint::from_row)
                .map_err(db_err)?;

            let mut history = Vec::new();
            for row in rows {
                history.push(row.map_err(db_err)?.decode()?);
            }
            Ok(history)
        })
    }
}
