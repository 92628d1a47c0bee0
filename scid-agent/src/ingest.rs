//! Per-source ingestion state machine.
//!
//! One `IngestionLoop` owns one source file. Each call to [`IngestionLoop::step`]
//! performs a single transition, so the loop can be driven to completion with
//! [`IngestionLoop::run`] or stepped through a bounded number of transitions.
//!
//! ```text
//! Idle -> Polling -> Decoding -> Committing -> CheckpointAdvance -> Idle
//!            transient error -> Backoff { attempt } -> Polling
//!            fatal error     -> Fatal
//! Idle -> Done (batch mode, caught up)      cancellation -> Stopped
//! ```
//!
//! The checkpoint is only advanced from `CheckpointAdvance`, which is only entered
//! after the sink confirmed a batch. A batch whose checkpoint write failed is kept
//! as a pending receipt and written before anything else is read.

use crate::backoff::BackoffPolicy;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{FormatError, IngestError};
use crate::format::{is_record_boundary, ContractId, RecordDecoder, RECORD_SIZE};
use crate::metrics;
use crate::sink::TickSink;
use crate::tailer::{TailRead, TailReader, DEFAULT_MAX_READ_BYTES};
use crate::upserter::{BatchLimits, BatchUpserter, CommitReceipt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Keep polling for appended records until cancelled.
    #[default]
    Continuous,
    /// Stop once the file has no more complete records and everything is committed.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Decoding,
    Committing,
    CheckpointAdvance,
    Backoff { attempt: u32 },
    Done,
    Fatal,
    Stopped,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fatal | Self::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub mode: Mode,
    pub poll_interval: Duration,
    pub max_read_bytes: usize,
    pub batch: BatchLimits,
    pub backoff: BackoffPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Continuous,
            poll_interval: Duration::from_secs(1),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            batch: BatchLimits::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Summary of a loop that finished without a fatal error.
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub source: PathBuf,
    pub state: LoopState,
    pub checkpoint: Option<Checkpoint>,
    pub records_committed: u64,
}

pub struct IngestionLoop {
    source: PathBuf,
    label: String,
    settings: LoopSettings,
    decoder: RecordDecoder,
    tailer: TailReader,
    upserter: BatchUpserter,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
    state: LoopState,
    checkpoint: Option<Checkpoint>,
    /// Next byte to read; ahead of the checkpoint by whatever is staged.
    read_offset: u64,
    chunk: Option<(u64, Vec<u8>)>,
    receipt: Option<CommitReceipt>,
    more_data: bool,
    caught_up: bool,
    failures: u32,
    records_committed: u64,
    last_error: Option<IngestError>,
}

/// Returns true when cancelled before the sleep elapsed.
async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

impl IngestionLoop {
    /// Build a loop for `source`, deriving the contract from its file name.
    pub fn new(
        source: impl Into<PathBuf>,
        sink: Arc<dyn TickSink>,
        store: Arc<dyn CheckpointStore>,
        settings: LoopSettings,
        cancel: CancellationToken,
    ) -> Result<Self, IngestError> {
        let source = source.into();
        let contract = ContractId::from_path(&source).ok_or_else(|| {
            IngestError::Config(format!(
                "cannot derive a contract from file name {}",
                source.display()
            ))
        })?;
        Ok(Self::with_contract(source, contract, sink, store, settings, cancel))
    }

    pub fn with_contract(
        source: impl Into<PathBuf>,
        contract: ContractId,
        sink: Arc<dyn TickSink>,
        store: Arc<dyn CheckpointStore>,
        settings: LoopSettings,
        cancel: CancellationToken,
    ) -> Self {
        let source = source.into();
        Self {
            label: source.display().to_string(),
            tailer: TailReader::new(&source, settings.max_read_bytes),
            upserter: BatchUpserter::new(sink, settings.batch),
            decoder: RecordDecoder::new(contract),
            source,
            settings,
            store,
            cancel,
            state: LoopState::Idle,
            checkpoint: None,
            read_offset: 0,
            chunk: None,
            receipt: None,
            // First poll happens without waiting.
            more_data: true,
            caught_up: false,
            failures: 0,
            records_committed: 0,
            last_error: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Last checkpoint this loop loaded or committed.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Drive the loop until it reaches a terminal state.
    pub async fn run(mut self) -> Result<LoopReport, IngestError> {
        metrics::ACTIVE_LOOPS.inc();
        info!(
            path = %self.source.display(),
            symbol = %self.decoder.contract().symbol,
            symbol_period = %self.decoder.contract().symbol_period,
            mode = ?self.settings.mode,
            "ingestion loop started"
        );

        let outcome = loop {
            match self.step().await {
                LoopState::Fatal => {
                    break Err(self.last_error.take().unwrap_or_else(|| {
                        IngestError::Config("loop halted without an error".into())
                    }))
                }
                state if state.is_terminal() => {
                    break Ok(LoopReport {
                        source: self.source.clone(),
                        state,
                        checkpoint: self.checkpoint.clone(),
                        records_committed: self.records_committed,
                    })
                }
                _ => {}
            }
        };

        metrics::ACTIVE_LOOPS.dec();
        outcome
    }

    /// Perform one transition and return the new state.
    pub async fn step(&mut self) -> LoopState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.cancel.is_cancelled() {
            self.finish_pending_checkpoint().await;
            return self.enter(LoopState::Stopped);
        }

        let next = match self.state {
            LoopState::Idle => self.idle().await,
            LoopState::Polling => self.poll().await,
            LoopState::Decoding => self.decode_chunk(),
            LoopState::Committing => self.commit_batch().await,
            LoopState::CheckpointAdvance => self.advance_checkpoint().await,
            LoopState::Backoff { attempt } => self.backoff(attempt).await,
            terminal => Ok(terminal),
        };

        let next = match next {
            Ok(state) => state,
            Err(err) => self.on_error(err),
        };
        self.enter(next)
    }

    fn enter(&mut self, next: LoopState) -> LoopState {
        match next {
            LoopState::Idle => self.failures = 0,
            LoopState::Done => info!(
                path = %self.source.display(),
                records_committed = self.records_committed,
                offset = self.checkpoint.as_ref().map(|c| c.byte_offset).unwrap_or_default(),
                "source caught up; batch ingestion done"
            ),
            LoopState::Stopped if self.state != LoopState::Stopped => info!(
                path = %self.source.display(),
                staged = self.upserter.len(),
                "ingestion loop stopped"
            ),
            _ => {}
        }
        self.state = next;
        next
    }

    async fn idle(&mut self) -> Result<LoopState, IngestError> {
        if self.settings.mode == Mode::Batch {
            return Ok(if self.caught_up {
                LoopState::Done
            } else {
                LoopState::Polling
            });
        }
        if !self.more_data && sleep_or_cancel(self.settings.poll_interval, &self.cancel).await {
            return Ok(LoopState::Stopped);
        }
        Ok(LoopState::Polling)
    }

    async fn poll(&mut self) -> Result<LoopState, IngestError> {
        if self.receipt.is_some() {
            return Ok(LoopState::CheckpointAdvance);
        }
        self.sync_checkpoint().await?;

        let started = Instant::now();
        let read = self.tailer.read_from(self.read_offset).await?;
        metrics::FILE_READ_DURATION.observe(started.elapsed().as_secs_f64());
        // A staged batch still owes a commit; only a read with nothing pending clears
        // the failure count.
        if self.upserter.is_empty() {
            self.failures = 0;
        }

        match read {
            TailRead::Truncated { file_size } => {
                warn!(
                    path = %self.source.display(),
                    offset = self.read_offset,
                    file_size,
                    "source file is shorter than the checkpoint; re-ingesting from the start"
                );
                metrics::TRUNCATION_RESETS_TOTAL.inc();
                let reset = self.store.reset(&self.source).await?;
                self.adopt(reset)?;
                Ok(LoopState::Polling)
            }
            TailRead::NoNewData => {
                self.more_data = false;
                if self.upserter.is_empty() {
                    self.caught_up = true;
                    Ok(LoopState::Idle)
                } else if self.should_commit() {
                    Ok(LoopState::Committing)
                } else {
                    Ok(LoopState::Idle)
                }
            }
            TailRead::Data {
                offset,
                bytes,
                file_size,
            } => {
                self.caught_up = false;
                self.more_data = offset + (bytes.len() as u64) < file_size;
                self.chunk = Some((offset, bytes));
                Ok(LoopState::Decoding)
            }
        }
    }

    fn decode_chunk(&mut self) -> Result<LoopState, IngestError> {
        let Some((offset, bytes)) = self.chunk.take() else {
            return Ok(LoopState::Polling);
        };
        let decoded = self
            .decoder
            .decode(&bytes, offset)
            .map_err(|source| IngestError::Format {
                path: self.source.clone(),
                offset,
                source,
            })?;

        let count = decoded.records.len();
        let header_len = decoded.consumed - count * RECORD_SIZE;
        let mut end_offset = offset + header_len as u64;
        let mut inconsistent = 0u64;
        for record in decoded.records {
            end_offset += RECORD_SIZE as u64;
            if !record.price_bounds_consistent() {
                inconsistent += 1;
            }
            self.upserter.stage(record, end_offset);
        }
        self.read_offset = offset + decoded.consumed as u64;

        if count > 0 {
            let contract = self.decoder.contract();
            metrics::RECORDS_DECODED_TOTAL
                .with_label_values(&[&contract.symbol, &contract.symbol_period])
                .inc_by(count as u64);
        }
        if inconsistent > 0 {
            metrics::INCONSISTENT_PRICE_RECORDS_TOTAL.inc_by(inconsistent);
            debug!(
                path = %self.source.display(),
                inconsistent,
                "records with high/low not bounding open/close"
            );
        }
        debug!(
            path = %self.source.display(),
            offset,
            record_count = count,
            leftover = decoded.leftover,
            staged = self.upserter.len(),
            "decoded chunk"
        );

        Ok(self.after_progress())
    }

    async fn commit_batch(&mut self) -> Result<LoopState, IngestError> {
        match self.upserter.commit_next().await? {
            Some(receipt) => {
                self.failures = 0;
                self.receipt = Some(receipt);
                Ok(LoopState::CheckpointAdvance)
            }
            None => Ok(LoopState::Idle),
        }
    }

    async fn advance_checkpoint(&mut self) -> Result<LoopState, IngestError> {
        let Some(receipt) = self.receipt else {
            return Ok(LoopState::Idle);
        };
        let base = self
            .checkpoint
            .clone()
            .unwrap_or_else(|| Checkpoint::initial(&self.source));
        let next = base.advanced(
            receipt.end_offset,
            receipt.records,
            receipt.last_timestamp_us,
        );

        let started = Instant::now();
        let result = self.store.commit(&next).await;
        metrics::CHECKPOINT_DURATION
            .with_label_values(&["commit"])
            .observe(started.elapsed().as_secs_f64());
        result?;

        self.failures = 0;
        self.receipt = None;
        self.records_committed += receipt.records;
        metrics::CHECKPOINT_OFFSET
            .with_label_values(&[&self.label])
            .set(next.byte_offset as i64);
        debug!(
            path = %self.source.display(),
            offset = next.byte_offset,
            record_index = next.record_index,
            "checkpoint advanced"
        );
        self.checkpoint = Some(next);

        Ok(self.after_progress())
    }

    async fn backoff(&mut self, attempt: u32) -> Result<LoopState, IngestError> {
        let delay = self.settings.backoff.delay(attempt);
        debug!(
            path = %self.source.display(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        if sleep_or_cancel(delay, &self.cancel).await {
            return Ok(LoopState::Stopped);
        }
        Ok(LoopState::Polling)
    }

    fn should_commit(&self) -> bool {
        if self.upserter.is_empty() {
            return false;
        }
        self.upserter.is_due(Instant::now())
            || (self.settings.mode == Mode::Batch && !self.more_data)
    }

    fn after_progress(&self) -> LoopState {
        if self.should_commit() {
            LoopState::Committing
        } else if self.more_data {
            LoopState::Polling
        } else {
            LoopState::Idle
        }
    }

    /// Reload the stored checkpoint and follow it if it moved under us.
    async fn sync_checkpoint(&mut self) -> Result<(), IngestError> {
        let started = Instant::now();
        let stored = self.store.load(&self.source).await?;
        metrics::CHECKPOINT_DURATION
            .with_label_values(&["load"])
            .observe(started.elapsed().as_secs_f64());

        match &self.checkpoint {
            Some(known) if known.byte_offset == stored.byte_offset => {
                self.checkpoint = Some(stored);
                Ok(())
            }
            Some(known) => {
                warn!(
                    path = %self.source.display(),
                    known_offset = known.byte_offset,
                    stored_offset = stored.byte_offset,
                    "checkpoint changed outside this loop; resuming from stored offset"
                );
                self.adopt(stored)
            }
            None => {
                info!(
                    path = %self.source.display(),
                    offset = stored.byte_offset,
                    record_index = stored.record_index,
                    last_timestamp = ?stored.last_timestamp(),
                    "resuming from checkpoint"
                );
                self.adopt(stored)
            }
        }
    }

    fn adopt(&mut self, checkpoint: Checkpoint) -> Result<(), IngestError> {
        let offset = checkpoint.byte_offset;
        if !is_record_boundary(offset) {
            return Err(IngestError::Format {
                path: self.source.clone(),
                offset,
                source: FormatError::Misaligned(offset),
            });
        }
        self.read_offset = offset;
        self.upserter.clear();
        self.tailer.invalidate();
        self.chunk = None;
        self.more_data = true;
        self.caught_up = false;
        metrics::CHECKPOINT_OFFSET
            .with_label_values(&[&self.label])
            .set(offset as i64);
        self.checkpoint = Some(checkpoint);
        Ok(())
    }

    /// A batch the sink already confirmed gets one last chance at its checkpoint.
    async fn finish_pending_checkpoint(&mut self) {
        if self.receipt.is_none() {
            return;
        }
        if let Err(err) = self.advance_checkpoint().await {
            warn!(
                path = %self.source.display(),
                error = %err,
                "checkpoint not advanced before shutdown; last batch will be re-upserted"
            );
        }
    }

    fn on_error(&mut self, err: IngestError) -> LoopState {
        metrics::LOOP_ERRORS_TOTAL
            .with_label_values(&[err.kind()])
            .inc();
        if !err.is_transient() {
            return self.halt(err);
        }

        self.failures += 1;
        if self.settings.backoff.exhausted(self.failures) {
            let attempts = self.failures;
            return self.halt(IngestError::RetriesExhausted {
                attempts,
                last: Box::new(err),
            });
        }

        metrics::BACKOFF_EVENTS_TOTAL.inc();
        warn!(
            path = %self.source.display(),
            attempt = self.failures,
            kind = err.kind(),
            error = %err,
            "transient failure; backing off"
        );
        LoopState::Backoff {
            attempt: self.failures,
        }
    }

    fn halt(&mut self, err: IngestError) -> LoopState {
        metrics::FATAL_LOOPS_TOTAL
            .with_label_values(&[err.kind()])
            .inc();
        error!(
            path = %self.source.display(),
            kind = err.kind(),
            error = %err,
            "ingestion halted for source"
        );
        self.last_error = Some(err);
        LoopState::Fatal
    }
}
