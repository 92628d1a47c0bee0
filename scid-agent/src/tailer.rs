//! Reads newly appended bytes from a growing source file.

use crate::error::IngestError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

pub const DEFAULT_MAX_READ_BYTES: usize = 8 * 1024 * 1024; // 8 MiB per iteration

#[derive(Debug, PartialEq, Eq)]
pub enum TailRead {
    /// File size unchanged since the last read at this offset.
    NoNewData,
    /// File is shorter than the requested offset; it was replaced or truncated.
    Truncated { file_size: u64 },
    /// Bytes starting at the requested offset.
    Data {
        offset: u64,
        bytes: Vec<u8>,
        file_size: u64,
    },
}

/// Tails one concrete path. Rotation to a new file is the caller's concern.
#[derive(Debug)]
pub struct TailReader {
    path: PathBuf,
    max_read_bytes: usize,
    last_read: Option<(u64, u64)>,
}

impl TailReader {
    pub fn new(path: impl Into<PathBuf>, max_read_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_read_bytes: max_read_bytes.max(1),
            last_read: None,
        }
    }

    /// Forget the last observed size so the next call re-reads from its offset.
    pub fn invalidate(&mut self) {
        self.last_read = None;
    }

    /// Return the bytes available beyond `offset`, up to the configured chunk size.
    pub async fn read_from(&mut self, offset: u64) -> Result<TailRead, IngestError> {
        let metadata = fs::metadata(&self.path)
            .await
            .map_err(|err| IngestError::io(&self.path, err))?;
        let file_size = metadata.len();

        if file_size < offset {
            self.last_read = None;
            return Ok(TailRead::Truncated { file_size });
        }
        if file_size == offset || self.last_read == Some((offset, file_size)) {
            return Ok(TailRead::NoNewData);
        }

        let available = file_size - offset;
        let to_read = available.min(self.max_read_bytes as u64) as usize;
        let bytes = read_new_bytes(&self.path, offset, to_read).await?;
        debug!(
            path = %self.path.display(),
            offset,
            file_size,
            bytes_read = bytes.len(),
            "read appended bytes"
        );

        // A short read (file shrank between stat and read) is picked up as truncation next time.
        if bytes.len() as u64 == available {
            self.last_read = Some((offset, file_size));
        } else {
            self.last_read = None;
        }

        Ok(TailRead::Data {
            offset,
            bytes,
            file_size,
        })
    }
}

async fn read_new_bytes(path: &Path, offset: u64, max_bytes: usize) -> Result<Vec<u8>, IngestError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|err| IngestError::io(path, err))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|err| IngestError::io(path, err))?;
    if max_bytes == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .map_err(|err| IngestError::io(path, err))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}
