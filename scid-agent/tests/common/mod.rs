#![allow(dead_code)]

use async_trait::async_trait;
use scid_agent::checkpoint::{Checkpoint, CheckpointStore, SqliteCheckpointStore};
use scid_agent::format::{FORMAT_VERSION, HEADER_SIZE, MAGIC, RECORD_SIZE, SC_EPOCH_OFFSET_US};
use scid_agent::sink::SqliteSink;
use scid_agent::{IngestError, TickSink};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 2024-01-02T00:00:00Z in Unix microseconds.
pub const BASE_UNIX_US: i64 = 1_704_153_600_000_000;

pub fn header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    buf.extend_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.resize(HEADER_SIZE, 0);
    buf
}

/// One record `seq` seconds after `BASE_UNIX_US`.
///
/// Written tick-style (open = 0, ask in high, bid in low) as Sierra Chart records
/// trades, unlike the OHLC-consistent records of the in-crate unit fixtures.
pub fn record(seq: u32) -> Vec<u8> {
    let unix_us = BASE_UNIX_US + i64::from(seq) * 1_000_000;
    let price = 5_000.0f32 + seq as f32 * 0.25;
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    buf.extend_from_slice(&(unix_us + SC_EPOCH_OFFSET_US).to_le_bytes());
    buf.extend_from_slice(&0f32.to_le_bytes());
    buf.extend_from_slice(&(price + 0.25).to_le_bytes());
    buf.extend_from_slice(&price.to_le_bytes());
    buf.extend_from_slice(&price.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&(seq % 7 + 1).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&(seq % 7 + 1).to_le_bytes());
    buf
}

pub fn records(range: std::ops::Range<u32>) -> Vec<u8> {
    range.flat_map(record).collect()
}

pub fn file_with_records(count: u32) -> Vec<u8> {
    let mut buf = header();
    buf.extend(records(0..count));
    buf
}

pub fn offset_after(records: u64) -> u64 {
    HEADER_SIZE as u64 + records * RECORD_SIZE as u64
}

pub fn append(path: &Path, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

pub async fn sqlite_sink(dir: &Path) -> SqliteSink {
    let sink = SqliteSink::new(dir.join("sink.db"), "trades").unwrap();
    sink.ensure_schema().await.unwrap();
    sink
}

/// Checkpoint store that records every committed offset and can fail a chosen commit.
pub struct ObservedStore {
    inner: SqliteCheckpointStore,
    pub commits: Mutex<Vec<(PathBuf, u64)>>,
    /// Zero-based index of the commit to fail fatally, simulating a crash right after
    /// the sink confirmed that batch.
    pub crash_on_commit: Option<usize>,
}

impl ObservedStore {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: SqliteCheckpointStore::new(path).unwrap(),
            commits: Mutex::new(Vec::new()),
            crash_on_commit: None,
        }
    }

    pub fn offsets_for(&self, source: &Path) -> Vec<u64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path == source)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for ObservedStore {
    async fn load(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        self.inner.load(source).await
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        let attempt = self.commits.lock().unwrap().len();
        if self.crash_on_commit == Some(attempt) {
            return Err(IngestError::CorruptCheckpoint {
                path: checkpoint.source_path.clone(),
                reason: "simulated crash".into(),
            });
        }
        self.inner.commit(checkpoint).await?;
        self.commits
            .lock()
            .unwrap()
            .push((checkpoint.source_path.clone(), checkpoint.byte_offset));
        Ok(())
    }

    async fn reset(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        self.inner.reset(source).await
    }
}
