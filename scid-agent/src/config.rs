use crate::backoff::BackoffPolicy;
use crate::ingest::{LoopSettings, Mode};
use crate::sink::QuestDbConfig;
use crate::upserter::BatchLimits;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `sink.password`.
pub const SINK_PASSWORD_ENV: &str = "SCID_AGENT_SINK_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ingest: IngestConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Source files, or directories scanned recursively for `*.scid`.
    pub sources: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub mode: Mode,
    /// Watch source directories for new files (continuous mode only).
    #[serde(default = "default_watch")]
    pub watch: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
    /// Zero retries transient failures forever.
    #[serde(default)]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Sqlite,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Database file for `sqlite`, directory for `json`.
    pub path: String,
    pub lock_dir: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Questdb,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub kind: SinkKind,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Database file for the `sqlite` sink.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint; unset disables it.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_RECORDS: usize = 200_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_READ_BYTES: usize = crate::tailer::DEFAULT_MAX_READ_BYTES;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_JITTER_PCT: f64 = 0.2;
const DEFAULT_TABLE: &str = "trades";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_watch() -> bool {
    true
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_commit_timeout_ms() -> u64 {
    DEFAULT_COMMIT_TIMEOUT_MS
}

fn default_max_read_bytes() -> usize {
    DEFAULT_MAX_READ_BYTES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter_pct() -> f64 {
    DEFAULT_JITTER_PCT
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_pct: DEFAULT_JITTER_PCT,
            max_attempts: 0,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let mut config = Self::parse(&raw)?;
        if let Ok(password) = std::env::var(SINK_PASSWORD_ENV) {
            if !password.is_empty() {
                config.sink.password = Some(password);
            }
        }
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ingest.sources.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("ingest.sources cannot be empty");
        }
        if self.ingest.poll_interval_ms == 0 {
            anyhow::bail!("ingest.poll_interval_ms must be greater than zero");
        }
        if self.batch.max_records == 0 {
            anyhow::bail!("batch.max_records must be greater than zero");
        }
        if self.batch.commit_timeout_ms == 0 {
            anyhow::bail!("batch.commit_timeout_ms must be greater than zero");
        }
        if self.batch.max_read_bytes == 0 {
            anyhow::bail!("batch.max_read_bytes must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_pct) {
            anyhow::bail!("retry.jitter_pct must be between 0 and 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms cannot exceed retry.max_delay_ms");
        }
        if self.checkpoint.path.trim().is_empty() || self.checkpoint.lock_dir.trim().is_empty() {
            anyhow::bail!("checkpoint.path and checkpoint.lock_dir are required");
        }

        let has = |value: &Option<String>| value.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        match self.sink.kind {
            SinkKind::Questdb if !has(&self.sink.url) => {
                anyhow::bail!("sink.url is required for the questdb sink")
            }
            SinkKind::Sqlite if !has(&self.sink.path) => {
                anyhow::bail!("sink.path is required for the sqlite sink")
            }
            _ => {}
        }

        if let Some(addr) = &self.metrics.listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|err| anyhow::anyhow!("invalid metrics.listen_addr {addr:?}: {err}"))?;
        }
        Ok(())
    }

    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.ingest
            .sources
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| expand(s))
            .collect()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        expand(&self.checkpoint.path)
    }

    pub fn lock_dir(&self) -> PathBuf {
        expand(&self.checkpoint.lock_dir)
    }

    pub fn sink_path(&self) -> Option<PathBuf> {
        self.sink.path.as_deref().map(expand)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics
            .listen_addr
            .as_deref()
            .and_then(|addr| addr.parse().ok())
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            mode: self.ingest.mode,
            poll_interval: Duration::from_millis(self.ingest.poll_interval_ms),
            max_read_bytes: self.batch.max_read_bytes,
            batch: BatchLimits {
                max_records: self.batch.max_records,
                flush_interval: Duration::from_millis(self.batch.flush_interval_ms),
                commit_timeout: Duration::from_millis(self.batch.commit_timeout_ms),
            },
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
                self.retry.jitter_pct,
                self.retry.max_attempts,
            ),
        }
    }

    pub fn questdb_config(&self) -> Option<QuestDbConfig> {
        if self.sink.kind != SinkKind::Questdb {
            return None;
        }
        Some(QuestDbConfig {
            url: self.sink.url.clone().unwrap_or_default(),
            table: self.sink.table.clone(),
            username: self.sink.username.clone(),
            password: self.sink.password.clone(),
            request_timeout: Duration::from_millis(self.sink.request_timeout_ms),
        })
    }

    /// Watching only makes sense for loops that keep running.
    pub fn watch_enabled(&self) -> bool {
        self.ingest.watch && self.ingest.mode == Mode::Continuous
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path.trim()).as_ref())
}
