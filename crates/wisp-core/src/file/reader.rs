//! Background chunk reader.
//!
//! Reading runs on its own task so multi-gigabyte files never stall the
//! session loop. Chunks are handed over through a bounded queue and the
//! reader pauses briefly after every batch.

use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::{READER_YIELD_EVERY, READER_YIELD_PAUSE};

/// Chunks buffered between the reader task and the consumer.
const QUEUE_DEPTH: usize = 32;

/// What the reader should produce.
#[derive(Debug, Clone)]
pub struct ReaderRequest {
    /// File to read
    pub path: PathBuf,
    /// First chunk index to produce
    pub start_index: u64,
    /// Total chunk count of the file
    pub total_chunks: u64,
    /// Chunk size in bytes
    pub chunk_size: usize,
}

/// Items produced by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// One chunk
    Chunk {
        /// Chunk index
        index: u64,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// No more chunks will follow
    Done,
}

/// Handle to a running reader task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ChunkReader {
    events: mpsc::Receiver<Result<ReaderEvent>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChunkReader {
    /// Start reading in the background.
    #[must_use]
    pub fn spawn(request: ReaderRequest) -> Self {
        let (tx, events) = mpsc::channel(QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(path = %request.path.display(), "Chunk reader cancelled");
                }
                result = produce(&request, &tx) => {
                    if let Err(e) = result {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });

        Self {
            events,
            cancel,
            task,
        }
    }

    /// Next chunk or the completion signal.
    ///
    /// Returns `None` once the reader has been cancelled or has finished.
    pub async fn next(&mut self) -> Option<Result<ReaderEvent>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop the reader; no further chunks are delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn produce(request: &ReaderRequest, tx: &mpsc::Sender<Result<ReaderEvent>>) -> Result<()> {
    let mut file = File::open(&request.path).await?;
    let offset = request.start_index * request.chunk_size as u64;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut produced = 0u64;
    for index in request.start_index..request.total_chunks {
        let mut data = vec![0u8; request.chunk_size];
        let read = read_full(&mut file, &mut data).await?;
        if read == 0 {
            tracing::warn!(
                path = %request.path.display(),
                index,
                "File shorter than announced, stopping early"
            );
            break;
        }
        data.truncate(read);

        if tx.send(Ok(ReaderEvent::Chunk { index, data })).await.is_err() {
            return Ok(());
        }

        produced += 1;
        if produced % READER_YIELD_EVERY == 0 {
            tokio::time::sleep(READER_YIELD_PAUSE).await;
        }
    }

    let _ = tx.send(Ok(ReaderEvent::Done)).await;
    Ok(())
}

/// Fill `buf` unless end of file comes first; returns the bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::chunk_count;

    async fn write_temp(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, content).await.expect("write");
        (dir, path)
    }

    #[tokio::test]
    async fn test_reader_produces_every_chunk_then_done() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = write_temp(&content).await;

        let mut reader = ChunkReader::spawn(ReaderRequest {
            path,
            start_index: 0,
            total_chunks: chunk_count(content.len() as u64, 1024),
            chunk_size: 1024,
        });

        let mut rebuilt = Vec::new();
        let mut expected_index = 0;
        loop {
            match reader.next().await.expect("event").expect("read ok") {
                ReaderEvent::Chunk { index, data } => {
                    assert_eq!(index, expected_index);
                    expected_index += 1;
                    rebuilt.extend_from_slice(&data);
                }
                ReaderEvent::Done => break,
            }
        }

        assert_eq!(expected_index, 10);
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn test_reader_starts_at_index() {
        let content = vec![7u8; 4096];
        let (_dir, path) = write_temp(&content).await;

        let mut reader = ChunkReader::spawn(ReaderRequest {
            path,
            start_index: 3,
            total_chunks: 4,
            chunk_size: 1024,
        });

        match reader.next().await.expect("event").expect("read ok") {
            ReaderEvent::Chunk { index, data } => {
                assert_eq!(index, 3);
                assert_eq!(data.len(), 1024);
            }
            ReaderEvent::Done => panic!("expected a chunk"),
        }
        assert_eq!(
            reader.next().await.expect("event").expect("read ok"),
            ReaderEvent::Done
        );
    }

    #[tokio::test]
    async fn test_reader_stops_after_cancel() {
        let content = vec![1u8; 1024 * 256];
        let (_dir, path) = write_temp(&content).await;

        let mut reader = ChunkReader::spawn(ReaderRequest {
            path,
            start_index: 0,
            total_chunks: 256,
            chunk_size: 1024,
        });

        assert!(reader.next().await.is_some());
        reader.cancel();
        assert!(reader.next().await.is_none());

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !reader.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reader task exits after cancel");
    }

    #[tokio::test]
    async fn test_reader_missing_file_reports_error() {
        let mut reader = ChunkReader::spawn(ReaderRequest {
            path: PathBuf::from("/definitely/not/here.bin"),
            start_index: 0,
            total_chunks: 1,
            chunk_size: 1024,
        });

        assert!(reader.next().await.expect("event").is_err());
    }
}
