//! Receiver engine: catalog, active download and the write target.
//!
//! The engine is a plain state machine owned by the receive session. Every
//! write is awaited before the next chunk is accepted, so on-disk order is
//! correct no matter how chunks interleave across channels.

use std::path::PathBuf;

use tokio::sync::watch;
use tokio::time::Instant;

use super::resume::{ResumeCheckpoint, ResumeStore};
use super::{rate, TransferProgress, TransferTuning};
use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::file::{self, Destination, FileSink};
use crate::protocol::{FileDescriptor, FileStart};
use crate::security;

/// The checkpoint watermark is persisted every this many chunks.
const CHECKPOINT_INTERVAL_CHUNKS: u64 = 160;

/// Chunks held back while `file_start` is still in flight on another channel.
const EARLY_CHUNK_LIMIT: usize = 256;

/// Receiver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Nothing happening
    Idle,
    /// Waiting for a password to be accepted
    Authenticating,
    /// `get_metadata` sent, no catalog yet
    AwaitingCatalog,
    /// Catalog available, no download running
    CatalogReady,
    /// The requested file is not available yet
    Scheduled,
    /// A download is running
    Downloading,
    /// The only offered file has been downloaded
    Finished,
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::AwaitingCatalog => "awaiting_catalog",
            Self::CatalogReady => "catalog_ready",
            Self::Scheduled => "scheduled",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// One entry of the receiver's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    /// Sender-assigned file id
    pub id: String,
    /// Sanitized `/`-separated relative name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Sender endpoint
    pub peer: EndpointId,
}

impl IncomingFile {
    /// Where the file lands below a download directory.
    pub fn relative_path(&self) -> PathBuf {
        file::relative_path(&self.name)
    }
}

/// A finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    /// Sender-assigned file id
    pub file_id: String,
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Output path, for disk destinations
    pub path: Option<PathBuf>,
    /// File content, for in-memory destinations
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug)]
struct ActiveDownload {
    file_id: String,
    name: String,
    size: u64,
    peer: EndpointId,
    sink: FileSink,
    requested_offset: u64,
    checkpoint: Option<ResumeCheckpoint>,
    stream: Option<StreamState>,
    early: Vec<(u64, Vec<u8>)>,
    end_seen: bool,
}

#[derive(Debug)]
struct StreamState {
    total_chunks: u64,
    start_index: u64,
    received: u64,
    bytes_written: u64,
    seen: Vec<bool>,
    contiguous: u64,
    started: Instant,
}

impl StreamState {
    fn expected(&self) -> u64 {
        self.total_chunks - self.start_index
    }

    fn is_complete(&self) -> bool {
        self.received >= self.expected()
    }
}

/// Receiving side of a session.
#[derive(Debug)]
pub struct ReceiverEngine {
    tuning: TransferTuning,
    state: ReceiverState,
    catalog: Vec<IncomingFile>,
    active: Option<ActiveDownload>,
    store: ResumeStore,
    progress: watch::Sender<TransferProgress>,
}

impl ReceiverEngine {
    /// Create an idle engine.
    pub fn new(tuning: TransferTuning, store: ResumeStore) -> Self {
        let (progress, _) = watch::channel(TransferProgress::default());
        Self {
            tuning,
            state: ReceiverState::Idle,
            catalog: Vec::new(),
            active: None,
            store,
            progress,
        }
    }

    /// Current state.
    pub const fn state(&self) -> ReceiverState {
        self.state
    }

    /// Current catalog.
    pub fn catalog(&self) -> &[IncomingFile] {
        &self.catalog
    }

    /// Checkpoint store used by this engine.
    pub const fn store(&self) -> &ResumeStore {
        &self.store
    }

    /// Subscribe to download progress.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// File id and offset of the outstanding request, if a download is
    /// waiting for its stream.
    pub fn pending_request(&self) -> Option<(String, u64)> {
        self.active
            .as_ref()
            .filter(|active| active.stream.is_none())
            .map(|active| (active.file_id.clone(), active.requested_offset))
    }

    /// The sender asked for a password.
    pub fn on_auth_required(&mut self) {
        if matches!(self.state, ReceiverState::Idle | ReceiverState::Authenticating) {
            self.state = ReceiverState::Authenticating;
        }
    }

    /// Verification completed and `get_metadata` went out.
    pub fn on_verified(&mut self) {
        if matches!(self.state, ReceiverState::Idle | ReceiverState::Authenticating) {
            self.state = ReceiverState::AwaitingCatalog;
        }
    }

    /// Replace the catalog with `files`.
    pub fn on_catalog(&mut self, files: Vec<FileDescriptor>, peer: &EndpointId) {
        self.catalog = files
            .into_iter()
            .map(|descriptor| IncomingFile {
                id: descriptor.id,
                name: file::sanitize_relative_path(&descriptor.name),
                size: descriptor.size,
                peer: peer.clone(),
            })
            .collect();

        tracing::debug!(peer = %peer, files = self.catalog.len(), "Catalog replaced");

        if self.catalog.is_empty() {
            return;
        }
        if matches!(
            self.state,
            ReceiverState::Idle
                | ReceiverState::Authenticating
                | ReceiverState::AwaitingCatalog
                | ReceiverState::Finished
        ) {
            self.state = ReceiverState::CatalogReady;
        }
    }

    /// Rebuild a one-file catalog from a resume checkpoint.
    pub fn restore(&mut self, checkpoint: &ResumeCheckpoint) {
        self.catalog = vec![IncomingFile {
            id: checkpoint.file_id.clone().unwrap_or_default(),
            name: checkpoint.name.clone(),
            size: checkpoint.size,
            peer: checkpoint.peer_id.clone(),
        }];
        self.state = ReceiverState::CatalogReady;
    }

    /// Open `destination` for catalog file `file_id` and return the byte
    /// offset to request.
    ///
    /// With a matching `resume` checkpoint the offset is the smaller of the
    /// bytes on disk and the checkpoint's watermark, rounded down to a chunk
    /// boundary. Otherwise the download starts at zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while another download is running,
    /// [`Error::UnknownFile`] for ids not in the catalog, or the error
    /// opening the destination.
    pub async fn begin(
        &mut self,
        file_id: &str,
        destination: Destination,
        resume: Option<&ResumeCheckpoint>,
    ) -> Result<u64> {
        if !matches!(
            self.state,
            ReceiverState::CatalogReady | ReceiverState::Finished
        ) {
            return Err(Error::InvalidState(format!(
                "cannot start a download while {}",
                self.state
            )));
        }

        let entry = self
            .catalog
            .iter()
            .find(|entry| entry.id == file_id)
            .cloned()
            .ok_or_else(|| Error::UnknownFile(file_id.to_string()))?;

        let sink = FileSink::open(&destination).await?;

        let offset = match (&destination, resume) {
            (Destination::Disk(_), Some(checkpoint)) => {
                let on_disk = sink.len().await?;
                let limit = on_disk.min(checkpoint.committed_bytes).min(entry.size);
                file::align_to_chunk(limit, self.tuning.chunk_size)
            }
            _ => 0,
        };

        let checkpoint = match &destination {
            Destination::Disk(path) => {
                let mut checkpoint = ResumeCheckpoint::new(
                    entry.name.clone(),
                    entry.size,
                    entry.peer.clone(),
                    path.clone(),
                    Some(entry.id.clone()),
                );
                checkpoint.committed_bytes = offset;
                if let Some(previous) = resume {
                    checkpoint.started_at = previous.started_at;
                }
                if let Err(e) = self.store.save(&checkpoint).await {
                    tracing::warn!("Could not persist resume checkpoint: {e}");
                }
                Some(checkpoint)
            }
            Destination::Memory => None,
        };

        tracing::info!(
            peer = %entry.peer,
            file = %entry.name,
            offset,
            "Download started"
        );

        self.progress.send_replace(TransferProgress {
            file_name: entry.name.clone(),
            bytes_received: offset,
            total_bytes: entry.size,
            total_chunks: file::chunk_count(entry.size, self.tuning.chunk_size),
            ..TransferProgress::default()
        });

        self.active = Some(ActiveDownload {
            file_id: entry.id,
            name: entry.name,
            size: entry.size,
            peer: entry.peer,
            sink,
            requested_offset: offset,
            checkpoint,
            stream: None,
            early: Vec::new(),
            end_seen: false,
        });
        self.state = ReceiverState::Downloading;

        Ok(offset)
    }

    /// The sender reported the file is not available yet.
    pub fn on_schedule_wait(&mut self, seconds: u64) {
        if self.pending_request().is_some() {
            tracing::info!(seconds, "File scheduled, waiting");
            self.state = ReceiverState::Scheduled;
        } else {
            tracing::debug!(seconds, "Ignoring schedule_wait without a pending request");
        }
    }

    /// The schedule countdown ran out. Returns the request to send again.
    pub fn on_schedule_elapsed(&mut self) -> Option<(String, u64)> {
        if self.state != ReceiverState::Scheduled {
            return None;
        }
        self.state = ReceiverState::Downloading;
        self.pending_request()
    }

    /// Begin-of-stream marker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResumeMismatch`] if the stream starts past the
    /// requested offset or disagrees about the file, [`Error::ProtocolError`]
    /// if the chunk count does not match. The download is abandoned in both
    /// cases.
    pub async fn on_file_start(&mut self, start: FileStart) -> Result<()> {
        let chunk_size = self.tuning.chunk_size;
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(file = %start.file_name, "Ignoring file_start without a download");
            return Ok(());
        };

        if self.state == ReceiverState::Scheduled {
            self.state = ReceiverState::Downloading;
        }

        if active.file_id.is_empty() {
            active.file_id.clone_from(&start.file_id);
        }

        let problem = if start.file_id != active.file_id || start.file_size != active.size {
            Some(Error::ResumeMismatch(format!(
                "stream is for {} ({} bytes), expected {}",
                start.file_id, start.file_size, active.file_id
            )))
        } else if start.total_chunks != file::chunk_count(active.size, chunk_size) {
            Some(Error::ProtocolError(format!(
                "stream announces {} chunks",
                start.total_chunks
            )))
        } else if start.start_offset > active.requested_offset {
            Some(Error::ResumeMismatch(format!(
                "stream starts at {}, requested {}",
                start.start_offset, active.requested_offset
            )))
        } else {
            None
        };
        if let Some(e) = problem {
            self.abort(false).await;
            return Err(e);
        }

        let start_index = file::start_index(start.start_offset, chunk_size);
        let expected = usize::try_from(start.total_chunks - start_index)
            .map_err(|_| Error::ProtocolError("chunk count too large".to_string()))?;
        active.stream = Some(StreamState {
            total_chunks: start.total_chunks,
            start_index,
            received: 0,
            bytes_written: 0,
            seen: vec![false; expected],
            contiguous: start_index,
            started: Instant::now(),
        });

        tracing::debug!(
            file = %active.name,
            start_index,
            total_chunks = start.total_chunks,
            file_type = %start.file_type,
            "Stream started"
        );

        for (index, data) in std::mem::take(&mut active.early) {
            self.on_chunk(index, &data).await?;
        }
        Ok(())
    }

    /// One chunk arrived.
    ///
    /// Oversized or out-of-range chunks are logged and dropped. Returns the
    /// finished file when this chunk completed a stream whose end marker had
    /// already arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the write fails; the download is
    /// abandoned and its checkpoint cleared.
    pub async fn on_chunk(&mut self, index: u64, data: &[u8]) -> Result<Option<CompletedFile>> {
        let chunk_size = self.tuning.chunk_size;
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(index, "Dropped chunk without a download");
            return Ok(None);
        };
        let Some(stream) = active.stream.as_mut() else {
            if active.early.len() < EARLY_CHUNK_LIMIT && data.len() <= chunk_size {
                active.early.push((index, data.to_vec()));
            } else {
                tracing::warn!(index, "Dropped chunk before file_start");
            }
            return Ok(None);
        };

        if let Err(e) = security::check_chunk_payload(data.len(), chunk_size) {
            tracing::warn!(index, "Dropped chunk: {e}");
            return Ok(None);
        }
        if index < stream.start_index || index >= stream.total_chunks {
            tracing::warn!(index, total = stream.total_chunks, "Dropped out-of-range chunk");
            return Ok(None);
        }
        let slot = usize::try_from(index - stream.start_index).unwrap_or(usize::MAX);
        if stream.seen.get(slot).copied().unwrap_or(true) {
            tracing::debug!(index, "Dropped duplicate chunk");
            return Ok(None);
        }

        if let Err(e) = active.sink.write_at(index * chunk_size as u64, data).await {
            tracing::error!(file = %active.name, index, "Write failed: {e}");
            self.abort(true).await;
            return Err(e);
        }

        stream.seen[slot] = true;
        stream.received += 1;
        stream.bytes_written += data.len() as u64;
        while stream
            .seen
            .get(usize::try_from(stream.contiguous - stream.start_index).unwrap_or(usize::MAX))
            .copied()
            .unwrap_or(false)
        {
            stream.contiguous += 1;
        }

        let received = stream.received;
        if received % self.tuning.progress_interval.max(1) == 0 {
            self.publish_progress(false);
        }
        if received % CHECKPOINT_INTERVAL_CHUNKS == 0 {
            self.persist_watermark().await;
        }

        let finish = self.active.as_ref().is_some_and(|active| {
            active.end_seen && active.stream.as_ref().is_some_and(StreamState::is_complete)
        });
        if finish {
            return self.finalize().await.map(Some);
        }
        Ok(None)
    }

    /// End-of-stream marker.
    ///
    /// Finalizes right away when every chunk is in. Otherwise returns
    /// `Ok(None)` and the caller should call [`on_end_grace_elapsed`]
    /// after a short grace period, since chunks on other channels may still
    /// be in flight.
    ///
    /// [`on_end_grace_elapsed`]: Self::on_end_grace_elapsed
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the destination cannot be closed.
    pub async fn on_file_end(&mut self) -> Result<Option<CompletedFile>> {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!("Ignoring file_end without a download");
            return Ok(None);
        };
        let Some(stream) = active.stream.as_ref() else {
            tracing::debug!("Ignoring file_end before file_start");
            return Ok(None);
        };

        active.end_seen = true;
        if stream.is_complete() {
            return self.finalize().await.map(Some);
        }
        tracing::debug!(
            received = stream.received,
            expected = stream.expected(),
            "file_end arrived ahead of chunks"
        );
        Ok(None)
    }

    /// Whether an end marker arrived and chunks are still outstanding.
    pub fn awaiting_stragglers(&self) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active.end_seen && !active.stream.as_ref().is_some_and(StreamState::is_complete)
        })
    }

    /// The grace period after `file_end` ran out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferIncomplete`] when chunks are still missing.
    /// The partial file and its checkpoint are kept for a later resume.
    pub async fn on_end_grace_elapsed(&mut self) -> Result<Option<CompletedFile>> {
        if !self.awaiting_stragglers() {
            return Ok(None);
        }

        self.persist_watermark().await;
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let missing = active
            .stream
            .as_ref()
            .map_or(0, |stream| stream.expected() - stream.received);
        tracing::warn!(file = %active.name, missing, "Stream ended with missing chunks");

        if let Err(e) = active.sink.close().await {
            tracing::warn!("Could not close partial file: {e}");
        }
        self.state = ReceiverState::CatalogReady;
        self.publish_progress(false);
        Err(Error::TransferIncomplete { dropped: missing })
    }

    async fn finalize(&mut self) -> Result<CompletedFile> {
        self.publish_progress(false);
        let Some(active) = self.active.take() else {
            return Err(Error::InvalidState("no active download".to_string()));
        };
        let path = active.sink.path().map(std::path::Path::to_path_buf);
        let elapsed = active
            .stream
            .as_ref()
            .map(|stream| stream.started.elapsed())
            .unwrap_or_default();

        let bytes = match active.sink.finish(active.size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(file = %active.name, "Could not finalize: {e}");
                self.clear_checkpoint().await;
                self.state = ReceiverState::CatalogReady;
                return Err(e);
            }
        };

        if active.checkpoint.is_some() {
            self.clear_checkpoint().await;
        }

        self.progress.send_modify(|progress| {
            progress.bytes_received = active.size;
            progress.finished = true;
            progress.eta = None;
        });

        self.state = if self.catalog.len() > 1 {
            ReceiverState::CatalogReady
        } else {
            ReceiverState::Finished
        };

        tracing::info!(
            peer = %active.peer,
            file = %active.name,
            size = active.size,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Download complete"
        );

        Ok(CompletedFile {
            file_id: active.file_id,
            name: active.name,
            size: active.size,
            path,
            bytes,
        })
    }

    /// Drop the active download.
    ///
    /// With `clear_checkpoint` the resume record is removed too.
    pub async fn abort(&mut self, clear_checkpoint: bool) {
        if let Some(active) = self.active.take() {
            tracing::debug!(file = %active.name, "Download abandoned");
            if let Err(e) = active.sink.close().await {
                tracing::debug!("Could not close output: {e}");
            }
        }
        if clear_checkpoint {
            self.clear_checkpoint().await;
        }
        self.state = if self.catalog.is_empty() {
            ReceiverState::Idle
        } else {
            ReceiverState::CatalogReady
        };
    }

    /// The connection dropped mid-download. Saves the watermark and keeps the
    /// checkpoint and partial file for a later resume.
    pub async fn suspend(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.persist_watermark().await;
        self.abort(false).await;
    }

    /// Forget the catalog of a previous sender. No-op while downloading.
    pub fn clear_catalog(&mut self) {
        if self.active.is_none() {
            self.catalog.clear();
            self.state = ReceiverState::Idle;
        }
    }

    /// Full reset: abandon the download, clear the catalog and checkpoint.
    pub async fn reset(&mut self) {
        self.abort(true).await;
        self.catalog.clear();
        self.state = ReceiverState::Idle;
        self.progress.send_replace(TransferProgress::default());
    }

    fn publish_progress(&self, finished: bool) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(stream) = active.stream.as_ref() else {
            return;
        };

        let chunk_size = self.tuning.chunk_size as u64;
        let bytes_received = (stream.start_index * chunk_size + stream.bytes_written).min(active.size);
        let (speed_bps, eta) = rate(
            stream.bytes_written,
            active.size.saturating_sub(bytes_received),
            stream.started.elapsed(),
        );

        self.progress.send_replace(TransferProgress {
            file_name: active.name.clone(),
            bytes_received,
            total_bytes: active.size,
            chunks_received: stream.received,
            total_chunks: stream.total_chunks,
            speed_bps,
            eta,
            finished,
        });
    }

    async fn persist_watermark(&mut self) {
        let chunk_size = self.tuning.chunk_size as u64;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let (Some(checkpoint), Some(stream)) = (active.checkpoint.as_mut(), active.stream.as_ref())
        else {
            return;
        };

        checkpoint.committed_bytes = (stream.contiguous * chunk_size).min(active.size);
        if let Err(e) = active.sink.flush().await {
            tracing::warn!("Could not flush output: {e}");
            return;
        }
        if let Err(e) = self.store.save(checkpoint).await {
            tracing::warn!("Could not persist resume checkpoint: {e}");
        }
    }

    async fn clear_checkpoint(&self) {
        if let Err(e) = self.store.clear().await {
            tracing::warn!("Could not clear resume checkpoint: {e}");
        }
    }
}
