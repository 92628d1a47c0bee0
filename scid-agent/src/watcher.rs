use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

pub const SOURCE_EXTENSION: &str = "scid";

/// Whether `path` names a source file by extension (case-insensitive).
pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(SOURCE_EXTENSION))
        .unwrap_or(false)
}

/// Forward paths of newly appearing source files until cancelled.
///
/// Only appearance matters here: appends to known files are picked up by each
/// loop's own polling.
pub async fn watch_directories(
    watch_paths: Vec<PathBuf>,
    poll_interval: Duration,
    event_tx: mpsc::Sender<PathBuf>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let watcher_tx = event_tx.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => handle_event(&watcher_tx, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .context("failed to create notify watcher")?;

    for path in &watch_paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch path {}", path.display()))?;
    }

    info!(count = watch_paths.len(), "watching source directories");

    // The watcher lives until shutdown.
    cancel_token.cancelled().await;
    debug!("file watcher shutting down");
    Ok(())
}

fn handle_event(event_tx: &mpsc::Sender<PathBuf>, event: Event) {
    let appeared = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    if !appeared {
        return;
    }
    for path in event.paths {
        if !is_source_file(&path) || !path.is_file() {
            continue;
        }
        debug!(path = %path.display(), "detected new source file");
        match event_tx.try_send(path) {
            Ok(_) => {}
            Err(TrySendError::Full(path)) => {
                warn!(path = %path.display(), "watcher channel full; dropping file event");
            }
            Err(TrySendError::Closed(path)) => {
                warn!(path = %path.display(), "watcher channel closed; dropping file event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_source_files() {
        assert!(is_source_file(Path::new("/data/ESU5.CME.scid")));
        assert!(is_source_file(Path::new("NQZ5.CME.SCID")));
        assert!(!is_source_file(Path::new("/data/ESU5.CME.dly")));
        assert!(!is_source_file(Path::new("/data/scid")));
    }

    #[tokio::test]
    async fn reports_created_source_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_directories(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(50),
            tx,
            cancel.clone(),
        ));
        // Give the backend a moment to register the watch.
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("ESZ5.CME.scid"), b"SCID").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "ESZ5.CME.scid");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
