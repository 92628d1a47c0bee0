//! Exclusive ownership of a source path for the lifetime of its ingestion loop.

use crate::checkpoint::source_file_stem;
use crate::error::IngestError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Advisory lock on `<lock_dir>/<source stem>.lock`, released on drop.
///
/// Uses `flock`, so it also excludes a second loop for the same source in another
/// process sharing the lock directory.
#[derive(Debug)]
pub struct SourceLock {
    file: File,
    lock_path: PathBuf,
    source: PathBuf,
}

impl SourceLock {
    pub fn acquire(lock_dir: &Path, source: &Path) -> Result<Self, IngestError> {
        std::fs::create_dir_all(lock_dir).map_err(|err| IngestError::io(lock_dir, err))?;
        let lock_path = lock_dir.join(format!("{}.lock", source_file_stem(source)));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| IngestError::io(&lock_path, err))?;

        try_lock_exclusive(&file).map_err(|err| match err.kind() {
            std::io::ErrorKind::WouldBlock => IngestError::SourceLocked(source.to_path_buf()),
            _ => IngestError::io(&lock_path, err),
        })?;

        debug!(
            path = %source.display(),
            lock = %lock_path.display(),
            "acquired source lock"
        );
        Ok(Self {
            file,
            lock_path,
            source: source.to_path_buf(),
        })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        unlock(&self.file);
        debug!(path = %self.source.display(), "released source lock");
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, err));
    }
    Err(err)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above; closing the descriptor would release the lock anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_for_same_source_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let source = Path::new("/data/ESU5.CME.scid");

        let first = SourceLock::acquire(dir.path(), source).unwrap();
        let err = SourceLock::acquire(dir.path(), source).unwrap_err();
        assert!(matches!(err, IngestError::SourceLocked(ref path) if path == source));
        assert!(!err.is_transient());

        drop(first);
        SourceLock::acquire(dir.path(), source).unwrap();
    }

    #[test]
    fn distinct_sources_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let a = SourceLock::acquire(dir.path(), Path::new("/data/ESU5.CME.scid")).unwrap();
        let b = SourceLock::acquire(dir.path(), Path::new("/data/ESZ5.CME.scid")).unwrap();
        assert_ne!(a.lock_path(), b.lock_path());
    }
}
