//! Error taxonomy for the ingestion core.
//!
//! Every failure a loop can hit is classified as either transient (retried with
//! backoff, checkpoint untouched) or fatal (the loop for that source halts and the
//! error is surfaced to the operator). `IngestError::is_transient` is the single
//! place that classification lives.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Structural problems in a source file. Always fatal for that source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad magic {found:?}; expected \"SCID\"")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported header size {0}")]
    HeaderSize(u32),

    #[error("unsupported record size {0}")]
    RecordSize(u32),

    #[error("offset {0} is not on a record boundary")]
    Misaligned(u64),
}

/// Failures reported by a sink implementation.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink unreachable, overloaded or otherwise temporarily unable to commit.
    #[error("sink unavailable: {0}")]
    Transient(String),

    /// Sink refused the batch for data reasons; retrying will not help.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error in {path} at offset {offset}: {source}")]
    Format {
        path: PathBuf,
        offset: u64,
        #[source]
        source: FormatError,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("sink commit timed out after {0:?}")]
    CommitTimeout(Duration),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("corrupted checkpoint for {path}: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("checkpoint for {path} would regress from {current} to {attempted}")]
    CheckpointRegression {
        path: PathBuf,
        current: u64,
        attempted: u64,
    },

    #[error("source {0} is already being ingested by another loop")]
    SourceLocked(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<IngestError>,
    },
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure should be retried with backoff rather than halting the loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Sink(SinkError::Transient(_))
                | Self::CommitTimeout(_)
                | Self::Checkpoint(_)
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Format { .. } => "format",
            Self::Sink(SinkError::Transient(_)) => "sink_transient",
            Self::Sink(SinkError::Rejected(_)) => "sink_rejected",
            Self::CommitTimeout(_) => "commit_timeout",
            Self::Checkpoint(_) => "checkpoint",
            Self::CorruptCheckpoint { .. } => "corrupt_checkpoint",
            Self::CheckpointRegression { .. } => "checkpoint_regression",
            Self::SourceLocked(_) => "source_locked",
            Self::Config(_) => "config",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}
