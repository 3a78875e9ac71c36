//! Chunked file transfer.
//!
//! The [`SenderEngine`] streams one file to one peer across that peer's
//! verified channels. The [`ReceiverEngine`] owns the receiving side: the
//! catalog, the active download and its write target. Both report progress
//! through `watch` channels so callers can render it at their own pace.
//!
//! Chunks carry their own index and are written at `index * chunk_size`,
//! so chunks arriving out of order across channels still land correctly.
//! There is no acknowledgment layer: a chunk that cannot be handed to a
//! channel is dropped, and the receiver notices the gap when the stream
//! ends short.

mod receiver;
mod resume;
mod sender;

pub use receiver::{CompletedFile, IncomingFile, ReceiverEngine, ReceiverState};
pub use resume::{ResumeCheckpoint, ResumeStore, CHECKPOINT_ID};
pub use sender::{SendJob, SendOutcome, SenderEngine};

use std::collections::BTreeMap;
use std::time::Duration;

use crate::channel::ChannelId;
use crate::code::EndpointId;

/// Tuning shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTuning {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Per-channel buffered bytes above which sending pauses
    pub max_buffered: usize,
    /// Progress is recomputed every this many chunks
    pub progress_interval: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_buffered: crate::MAX_BUFFERED_AMOUNT,
            progress_interval: crate::PROGRESS_INTERVAL_CHUNKS,
        }
    }
}

/// Receiver-side download progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    /// File being downloaded
    pub file_name: String,
    /// Bytes on the destination, resumed bytes included
    pub bytes_received: u64,
    /// Declared file size
    pub total_bytes: u64,
    /// Chunks received in this run
    pub chunks_received: u64,
    /// Total chunk count of the file
    pub total_chunks: u64,
    /// Throughput of this run in bytes per second
    pub speed_bps: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// Whether the file has been finalized
    pub finished: bool,
}

impl TransferProgress {
    /// Completion percentage, 0 to 100.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.finished { 100.0 } else { 0.0 };
        }
        (self.bytes_received as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

/// Share of the expected chunk count one channel has carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelShare {
    /// Channel id
    pub channel: ChannelId,
    /// Chunks this channel carried in the current transfer
    pub chunks_sent: u64,
    /// `chunks_sent / (total / channels)`, as a percentage capped at 100
    pub share: f64,
}

/// Sender-side progress of one peer's download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerTransferStats {
    /// Short display label for the peer
    pub label: String,
    /// File being sent
    pub file_name: String,
    /// Bytes handed to channels, including the skipped resume prefix
    pub bytes_sent: u64,
    /// File size
    pub total_bytes: u64,
    /// Completion percentage, 0 to 100
    pub progress: f64,
    /// Throughput in bytes per second
    pub speed_bps: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// Per-channel distribution
    pub channels: Vec<ChannelShare>,
    /// Whether the transfer has ended
    pub done: bool,
}

/// Sender-side progress across all peers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderStats {
    /// Progress keyed by peer
    pub peers: BTreeMap<EndpointId, PeerTransferStats>,
}

impl SenderStats {
    /// Whether any transfer is still running.
    pub fn is_active(&self) -> bool {
        self.peers.values().any(|peer| !peer.done)
    }
}

/// Throughput and time remaining for `done` of `total` bytes.
pub(crate) fn rate(done: u64, remaining: u64, elapsed: Duration) -> (f64, Option<Duration>) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || done == 0 {
        return (0.0, None);
    }
    let speed = done as f64 / secs;
    let eta = Duration::from_secs_f64(remaining as f64 / speed);
    (speed, Some(eta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut progress = TransferProgress {
            bytes_received: 50,
            total_bytes: 200,
            ..Default::default()
        };
        assert!((progress.percentage() - 25.0).abs() < f64::EPSILON);

        progress.total_bytes = 0;
        assert!(progress.percentage().abs() < f64::EPSILON);
        progress.finished = true;
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate() {
        let (speed, eta) = rate(1000, 3000, Duration::from_secs(2));
        assert!((speed - 500.0).abs() < f64::EPSILON);
        assert_eq!(eta, Some(Duration::from_secs(6)));

        assert_eq!(rate(0, 10, Duration::from_secs(1)), (0.0, None));
    }
}
