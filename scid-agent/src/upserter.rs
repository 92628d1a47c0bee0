//! Buffers decoded records and commits them to the sink in bounded batches.

use crate::error::IngestError;
use crate::format::TickRecord;
use crate::metrics;
use crate::sink::TickSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub flush_interval: Duration,
    pub commit_timeout: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 200_000,
            flush_interval: Duration::from_secs(1),
            commit_timeout: Duration::from_secs(30),
        }
    }
}

/// What a successful commit covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub records: u64,
    /// Source offset just past the last committed record.
    pub end_offset: u64,
    pub last_timestamp_us: Option<i64>,
}

struct Mark {
    end_offset: u64,
    staged_at: Instant,
}

pub struct BatchUpserter {
    sink: Arc<dyn TickSink>,
    limits: BatchLimits,
    records: Vec<TickRecord>,
    marks: Vec<Mark>,
}

impl BatchUpserter {
    pub fn new(sink: Arc<dyn TickSink>, limits: BatchLimits) -> Self {
        Self {
            sink,
            limits: BatchLimits {
                max_records: limits.max_records.max(1),
                ..limits
            },
            records: Vec::new(),
            marks: Vec::new(),
        }
    }

    /// Buffer a record that ends at source offset `end_offset`.
    pub fn stage(&mut self, record: TickRecord, end_offset: u64) {
        debug_assert!(self.marks.last().map_or(true, |m| m.end_offset < end_offset));
        self.records.push(record);
        self.marks.push(Mark {
            end_offset,
            staged_at: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.limits.max_records
    }

    /// Full, or the oldest buffered record has waited at least the flush interval.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.marks.first() {
            Some(oldest) => {
                self.is_full() || now.duration_since(oldest.staged_at) >= self.limits.flush_interval
            }
            None => false,
        }
    }

    /// Drop everything buffered (used when the source is rewound).
    pub fn clear(&mut self) {
        self.records.clear();
        self.marks.clear();
    }

    /// Commit up to `max_records` of the oldest buffered records as one upsert.
    ///
    /// Records stay buffered unless the sink confirms the whole batch, so a failed
    /// commit is retried with the same contents.
    pub async fn commit_next(&mut self) -> Result<Option<CommitReceipt>, IngestError> {
        if self.records.is_empty() {
            return Ok(None);
        }
        let count = self.records.len().min(self.limits.max_records);
        let batch = &self.records[..count];
        let started = Instant::now();

        let outcome = timeout(self.limits.commit_timeout, self.sink.upsert_batch(batch)).await;
        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(Ok(())) => {
                metrics::COMMIT_DURATION
                    .with_label_values(&["ok"])
                    .observe(elapsed);
                metrics::BATCHES_TOTAL.with_label_values(&["ok"]).inc();
            }
            Ok(Err(err)) => {
                let err = IngestError::from(err);
                metrics::COMMIT_DURATION
                    .with_label_values(&["error"])
                    .observe(elapsed);
                metrics::BATCHES_TOTAL.with_label_values(&[err.kind()]).inc();
                warn!(record_count = count, error = %err, "batch commit failed");
                return Err(err);
            }
            Err(_) => {
                metrics::COMMIT_DURATION
                    .with_label_values(&["timeout"])
                    .observe(elapsed);
                metrics::BATCHES_TOTAL.with_label_values(&["timeout"]).inc();
                warn!(
                    record_count = count,
                    timeout_ms = self.limits.commit_timeout.as_millis() as u64,
                    "batch commit timed out"
                );
                return Err(IngestError::CommitTimeout(self.limits.commit_timeout));
            }
        }

        let last_timestamp_us = batch.iter().map(|r| r.timestamp_us).max();
        let end_offset = self.marks[count - 1].end_offset;
        if let Some(first) = batch.first() {
            metrics::RECORDS_UPSERTED_TOTAL
                .with_label_values(&[&first.symbol, &first.symbol_period])
                .inc_by(count as u64);
        }

        self.records.drain(..count);
        self.marks.drain(..count);
        debug!(
            record_count = count,
            end_offset,
            remaining = self.records.len(),
            "batch committed"
        );

        Ok(Some(CommitReceipt {
            records: count as u64,
            end_offset,
            last_timestamp_us,
        }))
    }
}
