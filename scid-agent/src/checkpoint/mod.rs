//! Durable per-source ingestion progress.
//!
//! A checkpoint records the absolute byte offset up to which a source file has been
//! confirmed committed to the sink. Stores never let that offset move backwards
//! through `commit`; going back to zero requires an explicit `reset`.

mod json;
mod sqlite;

pub use json::JsonCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use crate::error::IngestError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_path: PathBuf,
    /// Absolute file offset of the first byte not yet confirmed committed.
    pub byte_offset: u64,
    /// Number of records committed so far (diagnostic).
    pub record_index: u64,
    /// Highest record timestamp committed, Unix-epoch microseconds.
    pub last_timestamp_us: Option<i64>,
    /// Unix seconds of the last write.
    #[serde(default)]
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn initial(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            byte_offset: 0,
            record_index: 0,
            last_timestamp_us: None,
            updated_at: 0,
        }
    }

    /// The checkpoint after `records` more records ending at `byte_offset` committed.
    pub fn advanced(&self, byte_offset: u64, records: u64, last_timestamp_us: Option<i64>) -> Self {
        Self {
            source_path: self.source_path.clone(),
            byte_offset,
            record_index: self.record_index + records,
            last_timestamp_us: match (self.last_timestamp_us, last_timestamp_us) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            updated_at: current_timestamp(),
        }
    }

    /// Committed watermark as a UTC instant.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp_us
            .and_then(DateTime::<Utc>::from_timestamp_micros)
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Current checkpoint for `source`, or a zero-offset one if none exists.
    async fn load(&self, source: &Path) -> Result<Checkpoint, IngestError>;

    /// Atomically replace the stored checkpoint. Fails with
    /// `IngestError::CheckpointRegression` if the offset would decrease.
    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), IngestError>;

    /// Explicitly rewind `source` to offset zero.
    async fn reset(&self, source: &Path) -> Result<Checkpoint, IngestError>;
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(crate) fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// File-system safe, collision-resistant name for per-source files (checkpoints, locks).
pub(crate) fn source_file_stem(path: &Path) -> String {
    let normalized = normalize_path(path);
    let readable: String = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
    format!("{readable}-{}", &digest[..16])
}
