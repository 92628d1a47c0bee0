pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod format;
pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod runner;
pub mod sink;
pub mod tailer;
pub mod upserter;
pub mod watcher;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use error::{FormatError, IngestError, SinkError};
pub use format::{ContractId, RecordDecoder, TickRecord};
pub use ingest::{IngestionLoop, LoopReport, LoopSettings, LoopState, Mode};
pub use sink::TickSink;
pub use upserter::{BatchLimits, BatchUpserter};
