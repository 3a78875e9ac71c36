//! Write targets for received files.
//!
//! A download writes to a persistent file when a destination path is
//! available, or accumulates in memory otherwise.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Where a download should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Persistent file at this path
    Disk(PathBuf),
    /// In-memory buffer, handed back on completion
    Memory,
}

/// Open write target for one file.
#[derive(Debug)]
pub enum FileSink {
    /// Persistent file
    Disk {
        /// Output path
        path: PathBuf,
        /// Open handle
        file: File,
    },
    /// In-memory fallback
    Memory {
        /// Accumulated bytes
        buffer: Vec<u8>,
    },
}

impl FileSink {
    /// Open the destination without discarding existing data.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be created.
    pub async fn open(destination: &Destination) -> Result<Self> {
        match destination {
            Destination::Disk(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .await
                    .map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;

                Ok(Self::Disk {
                    path: path.clone(),
                    file,
                })
            }
            Destination::Memory => Ok(Self::Memory { buffer: Vec::new() }),
        }
    }

    /// Bytes currently held by the target.
    ///
    /// # Errors
    ///
    /// Returns an error if file metadata cannot be read.
    pub async fn len(&self) -> Result<u64> {
        match self {
            Self::Disk { file, .. } => Ok(file.metadata().await?.len()),
            Self::Memory { buffer } => Ok(buffer.len() as u64),
        }
    }

    /// Write `data` at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the write does not complete.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Disk { path, file } => {
                let result = async {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(data).await
                }
                .await;
                result.map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))
            }
            Self::Memory { buffer } => {
                let start = usize::try_from(offset)
                    .map_err(|_| Error::WriteFailed("offset exceeds memory".to_string()))?;
                let end = start + data.len();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Output path, for persistent targets.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Disk { path, .. } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Push written data to stable storage without closing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the file cannot be flushed.
    pub async fn flush(&mut self) -> Result<()> {
        if let Self::Disk { path, file } = self {
            let result = async {
                file.flush().await?;
                file.sync_data().await
            }
            .await;
            result.map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;
        }
        Ok(())
    }

    /// Flush and close the target as is, keeping partial data for a resume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the file cannot be flushed.
    pub async fn close(self) -> Result<()> {
        if let Self::Disk { path, mut file } = self {
            let result = async {
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            result.map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;
        }
        Ok(())
    }

    /// Flush and close the target, trimming it to `size` bytes.
    ///
    /// Returns the buffered bytes for in-memory targets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the file cannot be flushed.
    pub async fn finish(self, size: u64) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Disk { path, mut file } => {
                let result = async {
                    file.set_len(size).await?;
                    file.flush().await?;
                    file.sync_all().await
                }
                .await;
                result.map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;
                tracing::debug!(path = %path.display(), size, "Closed output file");
                Ok(None)
            }
            Self::Memory { mut buffer } => {
                let size = usize::try_from(size)
                    .map_err(|_| Error::WriteFailed("size exceeds memory".to_string()))?;
                buffer.resize(size, 0);
                Ok(Some(buffer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_sink_out_of_order_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.bin");

        let mut sink = FileSink::open(&Destination::Disk(path.clone()))
            .await
            .expect("open");
        sink.write_at(4, b"efgh").await.expect("write");
        sink.write_at(0, b"abcd").await.expect("write");
        sink.write_at(8, b"ij").await.expect("write");
        assert_eq!(sink.len().await.expect("len"), 10);
        assert!(sink.finish(10).await.expect("finish").is_none());

        assert_eq!(std::fs::read(&path).expect("read"), b"abcdefghij");
    }

    #[tokio::test]
    async fn test_disk_sink_keeps_existing_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"abcd").expect("seed");

        let mut sink = FileSink::open(&Destination::Disk(path.clone()))
            .await
            .expect("open");
        assert_eq!(sink.len().await.expect("len"), 4);
        sink.write_at(4, b"efgh").await.expect("write");
        sink.finish(8).await.expect("finish");

        assert_eq!(std::fs::read(&path).expect("read"), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let mut sink = FileSink::open(&Destination::Memory).await.expect("open");
        sink.write_at(3, b"def").await.expect("write");
        sink.write_at(0, b"abc").await.expect("write");
        assert!(sink.path().is_none());

        let bytes = sink.finish(6).await.expect("finish").expect("buffer");
        assert_eq!(bytes, b"abcdef");
    }
}
