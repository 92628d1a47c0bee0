use super::{current_timestamp, normalize_path, Checkpoint, CheckpointStore};
use crate::error::IngestError;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Checkpoints kept in a SQLite table, one row per source path.
///
/// Each commit runs in its own immediate transaction, so a crash leaves either the
/// previous row or the new one.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    path: Arc<PathBuf>,
}

impl SqliteCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| IngestError::io(parent, err))?;
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn)?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IngestError> + Send + 'static,
    {
        let db_path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            op(&mut conn)
        })
        .await
        .map_err(|err| IngestError::Checkpoint(format!("checkpoint task join error: {err}")))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        let source = source.to_path_buf();
        self.with_connection(move |conn| {
            let key = normalize_path(&source);
            let record = conn
                .query_row(
                    "
                    SELECT byte_offset, record_index, last_timestamp_us, updated_at
                    FROM checkpoints
                    WHERE file_path = ?1
                    ",
                    params![key],
                    |row| {
                        Ok(Checkpoint {
                            source_path: source.clone(),
                            byte_offset: row.get::<_, i64>(0)? as u64,
                            record_index: row.get::<_, i64>(1)? as u64,
                            last_timestamp_us: row.get::<_, Option<i64>>(2)?,
                            updated_at: row.get::<_, i64>(3)?,
                        })
                    },
                )
                .optional()
                .map_err(db_error("failed to query checkpoint table"))?;

            Ok(record.unwrap_or_else(|| Checkpoint::initial(source.clone())))
        })
        .await
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        let checkpoint = checkpoint.clone();
        self.with_connection(move |conn| {
            let key = normalize_path(&checkpoint.source_path);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error("failed to begin checkpoint transaction"))?;

            let current: Option<i64> = tx
                .query_row(
                    "SELECT byte_offset FROM checkpoints WHERE file_path = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error("failed to read current checkpoint"))?;

            if let Some(current) = current.map(|v| v as u64) {
                if checkpoint.byte_offset < current {
                    return Err(IngestError::CheckpointRegression {
                        path: checkpoint.source_path.clone(),
                        current,
                        attempted: checkpoint.byte_offset,
                    });
                }
            }

            upsert_row(&tx, &key, &checkpoint)?;
            tx.commit()
                .map_err(db_error("failed to commit checkpoint transaction"))?;
            Ok(())
        })
        .await
    }

    async fn reset(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        let checkpoint = Checkpoint {
            updated_at: current_timestamp(),
            ..Checkpoint::initial(source)
        };
        let row = checkpoint.clone();
        self.with_connection(move |conn| {
            let key = normalize_path(&row.source_path);
            upsert_row(conn, &key, &row)
        })
        .await?;
        Ok(checkpoint)
    }
}

fn upsert_row(conn: &Connection, key: &str, checkpoint: &Checkpoint) -> Result<(), IngestError> {
    conn.execute(
        "
        INSERT INTO checkpoints (
            file_path,
            byte_offset,
            record_index,
            last_timestamp_us,
            updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(file_path) DO UPDATE SET
            byte_offset = excluded.byte_offset,
            record_index = excluded.record_index,
            last_timestamp_us = excluded.last_timestamp_us,
            updated_at = excluded.updated_at
        ",
        params![
            key,
            checkpoint.byte_offset as i64,
            checkpoint.record_index as i64,
            checkpoint.last_timestamp_us,
            current_timestamp()
        ],
    )
    .map_err(db_error("failed to upsert checkpoint record"))?;
    Ok(())
}

fn db_error(context: &'static str) -> impl Fn(rusqlite::Error) -> IngestError {
    move |err| IngestError::Checkpoint(format!("{context}: {err}"))
}

fn open_connection(path: &Path) -> Result<Connection, IngestError> {
    let conn = Connection::open(path).map_err(|err| {
        IngestError::Checkpoint(format!(
            "failed to open checkpoint db {}: {err}",
            path.display()
        ))
    })?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_error("failed to enable WAL mode for checkpoint db"))?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_error("failed to set checkpoint db synchronous mode"))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(db_error("failed to set checkpoint db busy timeout"))?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<(), IngestError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            file_path TEXT PRIMARY KEY,
            byte_offset INTEGER NOT NULL,
            record_index INTEGER NOT NULL,
            last_timestamp_us INTEGER,
            updated_at INTEGER NOT NULL
        );
        ",
    )
    .map_err(db_error("failed to create checkpoints table"))?;

    Ok(())
}
