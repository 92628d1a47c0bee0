//! Application runner: wires configuration to sinks, checkpoint stores and one
//! ingestion loop per discovered source file.

pub mod supervisor;

pub use supervisor::{ingest, RunSummary, Supervisor};

use crate::checkpoint::{CheckpointStore, JsonCheckpointStore, SqliteCheckpointStore};
use crate::config::{CheckpointBackend, Config, SinkKind};
use crate::sink::{QuestDbSink, SqliteSink, TickSink};
use crate::watcher::is_source_file;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Build the sink selected by `sink.kind`.
pub fn build_sink(config: &Config) -> Result<Arc<dyn TickSink>> {
    match config.sink.kind {
        SinkKind::Questdb => {
            let questdb = config
                .questdb_config()
                .context("questdb sink selected without questdb settings")?;
            info!(url = %questdb.url, table = %questdb.table, "configured questdb sink");
            Ok(Arc::new(
                QuestDbSink::new(questdb).context("failed to create questdb sink")?,
            ))
        }
        SinkKind::Sqlite => {
            let path = config
                .sink_path()
                .context("configuration validation ensures sink.path is set")?;
            info!(path = %path.display(), table = %config.sink.table, "configured sqlite sink");
            Ok(Arc::new(
                SqliteSink::new(&path, &config.sink.table)
                    .with_context(|| format!("failed to open sqlite sink {}", path.display()))?,
            ))
        }
    }
}

pub fn build_checkpoint_store(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    let path = config.checkpoint_path();
    match config.checkpoint.backend {
        CheckpointBackend::Sqlite => {
            info!(path = %path.display(), "using sqlite checkpoint store");
            Ok(Arc::new(SqliteCheckpointStore::new(&path).with_context(|| {
                format!("failed to open checkpoint database {}", path.display())
            })?))
        }
        CheckpointBackend::Json => {
            info!(dir = %path.display(), "using json checkpoint store");
            Ok(Arc::new(JsonCheckpointStore::new(&path).with_context(|| {
                format!("failed to open checkpoint directory {}", path.display())
            })?))
        }
    }
}

/// Run the agent until its loops finish (batch mode) or `cancel_token` fires.
pub async fn run(config: &Config, cancel_token: CancellationToken) -> Result<RunSummary> {
    info!(mode = ?config.ingest.mode, "scid-agent starting");
    let sink = build_sink(config)?;
    let store = build_checkpoint_store(config)?;
    ingest(config, sink, store, cancel_token).await
}

/// Expand configured roots into the source files they contain, sorted and deduplicated.
///
/// Files are canonicalized so one source always maps to the same checkpoint and lock
/// regardless of how it was spelled in the configuration.
pub fn discover_sources(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for root in roots {
        if !root.exists() {
            debug!(path = %root.display(), "source path does not exist on disk; skipping");
            continue;
        }
        collect_sources(root, &mut sources)?;
    }
    sources.sort();
    sources.dedup();
    debug!(file_count = sources.len(), "source discovery complete");
    Ok(sources)
}

fn collect_sources(path: &Path, sources: &mut Vec<PathBuf>) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to read metadata for {}", path.display()))?;
    if metadata.is_file() {
        if is_source_file(path) {
            sources.push(canonical(path));
        } else {
            debug!(path = %path.display(), "not a source file; skipping");
        }
        return Ok(());
    }

    if metadata.is_dir() {
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry = entry?;
            collect_sources(&entry.path(), sources)?;
        }
    }
    Ok(())
}

pub(crate) fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
