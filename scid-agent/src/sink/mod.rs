//! Destinations for decoded tick records.
//!
//! A sink must make `upsert_batch` idempotent on the dedup key
//! `(time, symbol, symbol_period)` and all-or-nothing per call: it returns `Ok` only
//! once every record of the batch is durable.

mod questdb;
mod sqlite;

pub use questdb::{QuestDbConfig, QuestDbSink};
pub use sqlite::{DailyVolume, SqliteSink};

use crate::error::SinkError;
use crate::format::TickRecord;
use async_trait::async_trait;

#[async_trait]
pub trait TickSink: Send + Sync {
    /// Create the target table if needed. Idempotent; run once before any loop starts.
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    /// Upsert `records` as a single unit keyed on `(time, symbol, symbol_period)`.
    async fn upsert_batch(&self, records: &[TickRecord]) -> Result<(), SinkError>;
}

/// Validate a table name before it is spliced into DDL/DML.
pub(crate) fn validate_table_name(table: &str) -> Result<(), SinkError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        && !table.starts_with(|ch: char| ch.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SinkError::Rejected(format!("invalid table name {table:?}")))
    }
}
