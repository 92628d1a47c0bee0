use super::{current_timestamp, source_file_stem, Checkpoint, CheckpointStore};
use crate::error::IngestError;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::debug;
use uuid::Uuid;

/// Checkpoints kept as one JSON document per source inside a directory.
///
/// Writes go to a uniquely named temp file that is fsynced and then renamed over the
/// previous document, so readers only ever see a complete old or new value.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| IngestError::io(&dir, err))?;
        Ok(Self { dir })
    }

    fn document_path(&self, source: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", source_file_stem(source)))
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn load(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        let path = self.document_path(source);
        let source = source.to_path_buf();
        task::spawn_blocking(move || read_document(&path, &source))
            .await
            .map_err(|err| IngestError::Checkpoint(format!("checkpoint task join error: {err}")))?
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        let path = self.document_path(&checkpoint.source_path);
        let checkpoint = checkpoint.clone();
        task::spawn_blocking(move || {
            let current = read_document(&path, &checkpoint.source_path)?;
            if checkpoint.byte_offset < current.byte_offset {
                return Err(IngestError::CheckpointRegression {
                    path: checkpoint.source_path.clone(),
                    current: current.byte_offset,
                    attempted: checkpoint.byte_offset,
                });
            }
            replace_document(&path, &checkpoint)
        })
        .await
        .map_err(|err| IngestError::Checkpoint(format!("checkpoint task join error: {err}")))?
    }

    async fn reset(&self, source: &Path) -> Result<Checkpoint, IngestError> {
        let path = self.document_path(source);
        let checkpoint = Checkpoint {
            updated_at: current_timestamp(),
            ..Checkpoint::initial(source)
        };
        let written = checkpoint.clone();
        task::spawn_blocking(move || replace_document(&path, &written))
            .await
            .map_err(|err| {
                IngestError::Checkpoint(format!("checkpoint task join error: {err}"))
            })??;
        Ok(checkpoint)
    }
}

fn read_document(path: &Path, source: &Path) -> Result<Checkpoint, IngestError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Checkpoint::initial(source));
        }
        Err(err) => return Err(IngestError::io(path, err)),
    };

    let checkpoint: Checkpoint =
        serde_json::from_slice(&raw).map_err(|err| IngestError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    if checkpoint.source_path != source {
        return Err(IngestError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: format!(
                "document belongs to {}, expected {}",
                checkpoint.source_path.display(),
                source.display()
            ),
        });
    }
    Ok(checkpoint)
}

fn replace_document(path: &Path, checkpoint: &Checkpoint) -> Result<(), IngestError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dir.join(format!("{file_name}.{}.tmp", Uuid::new_v4()));

    let mut stored = checkpoint.clone();
    stored.updated_at = current_timestamp();
    let serialized = serde_json::to_vec_pretty(&stored)
        .map_err(|err| IngestError::Checkpoint(format!("failed to encode checkpoint: {err}")))?;

    let write_temp = || -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(&serialized)?;
        file.sync_all()
    };
    if let Err(err) = write_temp() {
        let _ = fs::remove_file(&temp_path);
        return Err(IngestError::io(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(IngestError::io(path, err));
    }
    sync_dir(dir).map_err(|err| IngestError::io(dir, err))?;

    debug!(
        source = %checkpoint.source_path.display(),
        offset = checkpoint.byte_offset,
        output = %path.display(),
        "replaced checkpoint document"
    );
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path()).unwrap();
        let source = Path::new("/data/ESU5.CME.scid");

        assert_eq!(store.load(source).await.unwrap().byte_offset, 0);
        store
            .commit(&Checkpoint::initial(source).advanced(136, 2, Some(7)))
            .await
            .unwrap();

        let loaded = store.load(source).await.unwrap();
        assert_eq!(loaded.byte_offset, 136);
        assert_eq!(loaded.record_index, 2);
        assert_eq!(loaded.last_timestamp_us, Some(7));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path()).unwrap();
        let source = Path::new("/data/ESU5.CME.scid");
        for offset in [96u64, 136, 176] {
            let current = store.load(source).await.unwrap();
            store
                .commit(&current.advanced(offset, 1, None))
                .await
                .unwrap();
        }

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1, "unexpected files: {names:?}");
        assert!(names[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn regression_is_refused_but_reset_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path()).unwrap();
        let source = Path::new("/data/ESU5.CME.scid");
        let base = Checkpoint::initial(source);
        store.commit(&base.advanced(176, 3, None)).await.unwrap();

        let err = store.commit(&base.advanced(136, 2, None)).await.unwrap_err();
        assert!(matches!(err, IngestError::CheckpointRegression { .. }));

        store.reset(source).await.unwrap();
        assert_eq!(store.load(source).await.unwrap().byte_offset, 0);
    }

    #[tokio::test]
    async fn corrupted_document_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path()).unwrap();
        let source = Path::new("/data/ESU5.CME.scid");
        fs::write(store.document_path(source), b"{\"source_path\": ").unwrap();

        let err = store.load(source).await.unwrap_err();
        assert!(matches!(err, IngestError::CorruptCheckpoint { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn stray_temp_file_from_crash_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path()).unwrap();
        let source = Path::new("/data/ESU5.CME.scid");
        store
            .commit(&Checkpoint::initial(source).advanced(96, 1, None))
            .await
            .unwrap();
        // A crash between temp write and rename leaves a half-written temp file.
        let doc = store.document_path(source);
        fs::write(doc.with_extension("json.dead.tmp"), b"{ half").unwrap();

        assert_eq!(store.load(source).await.unwrap().byte_offset, 96);
    }
}
