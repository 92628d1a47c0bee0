//! Spawns and reaps one ingestion loop per source file.

use super::{canonical, discover_sources};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::IngestError;
use crate::ingest::{IngestionLoop, LoopReport, LoopSettings, Mode};
use crate::lock::SourceLock;
use crate::sink::TickSink;
use crate::watcher::{watch_directories, WATCHER_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time granted after cancellation on top of the commit timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type LoopResult = Result<LoopReport, IngestError>;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<LoopReport>,
    pub failed: Vec<(PathBuf, IngestError)>,
    /// Loops that did not stop within the shutdown grace period.
    pub aborted: Vec<PathBuf>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }

    fn record(&mut self, source: PathBuf, result: LoopResult) {
        match result {
            Ok(report) => self.completed.push(report),
            Err(err) => self.failed.push((source, err)),
        }
    }
}

/// Owns the running loops. A source path never has two live loops.
pub struct Supervisor {
    settings: LoopSettings,
    sink: Arc<dyn TickSink>,
    store: Arc<dyn CheckpointStore>,
    lock_dir: PathBuf,
    cancel_token: CancellationToken,
    active: HashMap<PathBuf, JoinHandle<LoopResult>>,
    summary: RunSummary,
}

impl Supervisor {
    pub fn new(
        settings: LoopSettings,
        sink: Arc<dyn TickSink>,
        store: Arc<dyn CheckpointStore>,
        lock_dir: PathBuf,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            settings,
            sink,
            store,
            lock_dir,
            cancel_token,
            active: HashMap::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn active_sources(&self) -> usize {
        self.active.values().filter(|h| !h.is_finished()).count()
    }

    /// Start a loop for `path` unless one is already running for it.
    pub async fn spawn_if_needed(&mut self, path: PathBuf) {
        if let Some(handle) = self.active.get(&path) {
            if !handle.is_finished() {
                return;
            }
            if let Some(handle) = self.active.remove(&path) {
                self.reap(path.clone(), handle).await;
            }
        }

        debug!(path = %path.display(), "spawning ingestion loop");
        let source = path.clone();
        let lock_dir = self.lock_dir.clone();
        let sink = self.sink.clone();
        let store = self.store.clone();
        let settings = self.settings.clone();
        let cancel_token = self.cancel_token.clone();
        let handle = tokio::spawn(async move {
            let _lock = SourceLock::acquire(&lock_dir, &source)?;
            IngestionLoop::new(source, sink, store, settings, cancel_token)?
                .run()
                .await
        });
        self.active.insert(path, handle);
    }

    async fn reap(&mut self, path: PathBuf, handle: JoinHandle<LoopResult>) {
        match handle.await {
            Ok(result) => self.summary.record(path, result),
            Err(err) => {
                error!(path = %path.display(), error = %err, "ingestion task panicked");
                self.summary.aborted.push(path);
            }
        }
    }

    /// Wait for every loop. Once cancelled, all loops together get the commit timeout
    /// plus a grace period; whatever is still running then is aborted.
    pub async fn finish(mut self) -> RunSummary {
        let grace = self.settings.batch.commit_timeout + SHUTDOWN_GRACE;
        let expired = CancellationToken::new();
        let timer = tokio::spawn({
            let cancel_token = self.cancel_token.clone();
            let expired = expired.clone();
            async move {
                cancel_token.cancelled().await;
                sleep(grace).await;
                expired.cancel();
            }
        });
        let active: Vec<_> = self.active.drain().collect();

        for (path, mut handle) in active {
            let result = tokio::select! {
                res = &mut handle => Some(res),
                _ = expired.cancelled() => None,
            };

            match result {
                Some(Ok(result)) => {
                    debug!(path = %path.display(), ok = result.is_ok(), "ingestion loop finished");
                    self.summary.record(path, result);
                }
                Some(Err(err)) => {
                    warn!(path = %path.display(), error = %err, "ingestion task exited abnormally");
                    self.summary.aborted.push(path);
                }
                None => {
                    warn!(path = %path.display(), "ingestion loop did not stop within timeout; aborting");
                    handle.abort();
                    self.summary.aborted.push(path);
                }
            }
        }
        timer.abort();
        self.summary
    }
}

/// Ensure the sink schema, start loops for all configured sources and run until
/// they finish (batch mode) or `cancel_token` fires (continuous mode).
pub async fn ingest(
    config: &Config,
    sink: Arc<dyn TickSink>,
    store: Arc<dyn CheckpointStore>,
    cancel_token: CancellationToken,
) -> Result<RunSummary> {
    sink.ensure_schema()
        .await
        .context("failed to ensure sink schema")?;

    let roots = config.source_paths();
    let sources = discover_sources(&roots).context("failed to discover source files")?;
    info!(file_count = sources.len(), "discovered source files");

    let settings = config.loop_settings();
    let poll_interval = settings.poll_interval;
    let continuous = config.ingest.mode == Mode::Continuous;
    let mut supervisor = Supervisor::new(
        settings,
        sink,
        store,
        config.lock_dir(),
        cancel_token.clone(),
    );
    for source in sources {
        supervisor.spawn_if_needed(source).await;
    }

    if config.watch_enabled() {
        let (event_tx, mut event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let watch_roots: Vec<PathBuf> = roots
            .iter()
            .filter(|p| p.is_dir())
            .map(|p| canonical(p))
            .collect();
        let mut watcher_handle = tokio::spawn({
            let cancel_token = cancel_token.clone();
            async move {
                if let Err(err) =
                    watch_directories(watch_roots, poll_interval, event_tx, cancel_token).await
                {
                    error!(error = %err, "file watcher exited unexpectedly");
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                maybe_path = event_rx.recv() => {
                    match maybe_path {
                        Some(path) => {
                            let path = canonical(&path);
                            info!(path = %path.display(), "new source file detected");
                            supervisor.spawn_if_needed(path).await;
                        }
                        None => {
                            // Watcher gone; existing loops keep running until shutdown.
                            cancel_token.cancelled().await;
                            break;
                        }
                    }
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut watcher_handle)
            .await
            .is_err()
        {
            warn!("file watcher did not stop within timeout; aborting");
            watcher_handle.abort();
        }
    } else if continuous {
        cancel_token.cancelled().await;
    }

    info!(active = supervisor.active_sources(), "waiting for ingestion loops");
    let summary = supervisor.finish().await;
    info!(
        completed = summary.completed.len(),
        failed = summary.failed.len(),
        aborted = summary.aborted.len(),
        "ingestion finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;
    use crate::sink::SqliteSink;

    #[tokio::test(start_paused = true)]
    async fn hung_loops_share_one_shutdown_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn TickSink> =
            Arc::new(SqliteSink::new(dir.path().join("sink.db"), "trades").unwrap());
        let store: Arc<dyn CheckpointStore> =
            Arc::new(SqliteCheckpointStore::new(dir.path().join("cp.db")).unwrap());
        let settings = LoopSettings::default();
        let grace = settings.batch.commit_timeout + SHUTDOWN_GRACE;
        let cancel_token = CancellationToken::new();
        let mut supervisor = Supervisor::new(
            settings,
            sink,
            store,
            dir.path().join("locks"),
            cancel_token.clone(),
        );
        for name in ["ESU5.CME.scid", "ESZ5.CME.scid", "ESH6.CME.scid"] {
            let hung = tokio::spawn(std::future::pending::<LoopResult>());
            supervisor.active.insert(PathBuf::from(name), hung);
        }

        cancel_token.cancel();
        let started = tokio::time::Instant::now();
        let summary = supervisor.finish().await;

        assert_eq!(summary.aborted.len(), 3);
        assert!(summary.completed.is_empty());
        assert!(started.elapsed() < grace * 2, "took {:?}", started.elapsed());
    }
}
