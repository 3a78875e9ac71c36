//! Sender engine: streams one file to one peer.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{rate, ChannelShare, PeerTransferStats, SenderStats, TransferTuning};
use crate::channel::{Channel, ChannelId};
use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::file::{self, ChunkReader, ReaderEvent, ReaderRequest};
use crate::protocol::{FileStart, Frame, Message};

/// Pause between buffered-amount checks while a channel is saturated.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// One file to stream to one peer.
#[derive(Debug, Clone)]
pub struct SendJob {
    /// Receiving peer
    pub peer: EndpointId,
    /// Sender-assigned file id
    pub file_id: String,
    /// File on disk
    pub path: PathBuf,
    /// Name announced to the receiver
    pub name: String,
    /// File size
    pub size: u64,
    /// Resume offset requested by the receiver
    pub offset_bytes: u64,
}

/// Result of a completed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Total chunk count of the file
    pub total_chunks: u64,
    /// First chunk index sent
    pub start_index: u64,
    /// Chunks handed to channels
    pub chunks_sent: u64,
}

/// Streams files over a peer's verified channels.
#[derive(Debug, Clone)]
pub struct SenderEngine {
    tuning: TransferTuning,
    stats: watch::Sender<SenderStats>,
    cancel: CancellationToken,
}

impl SenderEngine {
    /// Create an engine reporting into `stats`.
    pub fn new(
        tuning: TransferTuning,
        stats: watch::Sender<SenderStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tuning,
            stats,
            cancel,
        }
    }

    /// Stream `job` over `links`.
    ///
    /// `links` must be ordered by channel id; the first one is the primary
    /// channel carrying `file_start` and `file_end`. Chunk `i` goes to
    /// `links[i % links.len()]`. A link that fails is taken out of the
    /// distribution and the chunks assigned to it are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] when no link remains,
    /// [`Error::TransferIncomplete`] when chunks were dropped (no
    /// `file_end` is sent then), [`Error::SessionClosed`] on cancellation,
    /// or the reader's error.
    pub async fn send(&self, job: SendJob, links: Vec<Channel>) -> Result<SendOutcome> {
        if links.is_empty() {
            return Err(Error::ConnectionLost(job.peer.to_string()));
        }

        let chunk_size = self.tuning.chunk_size;
        let total_chunks = file::chunk_count(job.size, chunk_size);
        let start_index = file::start_index(job.offset_bytes, chunk_size).min(total_chunks);
        let start_offset = (start_index * chunk_size as u64).min(job.size);
        let expected = total_chunks - start_index;

        let ids: Vec<ChannelId> = links.iter().map(Channel::id).collect();
        let mut slots: Vec<Option<Channel>> = links.into_iter().map(Some).collect();
        let mut counts = vec![0u64; slots.len()];

        let start = Frame::Control(Message::FileStart(FileStart {
            file_id: job.file_id.clone(),
            file_name: job.name.clone(),
            file_size: job.size,
            file_type: file::mime_type(&job.path),
            total_chunks,
            start_offset,
        }));
        self.send_control(&mut slots, &start, &job.peer)?;

        tracing::info!(
            peer = %job.peer,
            file = %job.name,
            channels = slots.len(),
            start_index,
            total_chunks,
            "Transfer started"
        );

        let mut reader = ChunkReader::spawn(ReaderRequest {
            path: job.path.clone(),
            start_index,
            total_chunks,
            chunk_size,
        });

        let started = Instant::now();
        let mut handed = 0u64;
        let mut dropped = 0u64;
        let mut bytes = 0u64;
        self.publish(&job, start_offset, 0, started, (&ids, &counts), expected, false);

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => {
                    reader.cancel();
                    self.finish_stats(&job.peer);
                    return Err(Error::SessionClosed);
                }
                event = reader.next() => event,
            };

            let (index, data) = match event {
                Some(Ok(ReaderEvent::Chunk { index, data })) => (index, data),
                Some(Ok(ReaderEvent::Done)) | None => break,
                Some(Err(e)) => {
                    self.finish_stats(&job.peer);
                    return Err(e);
                }
            };

            let slot = usize::try_from(index % slots.len() as u64).unwrap_or_default();
            let len = data.len() as u64;

            match self.send_chunk(&mut slots[slot], index, data).await {
                Ok(true) => {
                    handed += 1;
                    bytes += len;
                    counts[slot] += 1;
                }
                Ok(false) => {
                    dropped += 1;
                    if slots.iter().all(Option::is_none) {
                        reader.cancel();
                        self.finish_stats(&job.peer);
                        return Err(Error::ConnectionLost(job.peer.to_string()));
                    }
                }
                Err(e) => {
                    reader.cancel();
                    self.finish_stats(&job.peer);
                    return Err(e);
                }
            }

            if (handed + dropped) % self.tuning.progress_interval.max(1) == 0 {
                self.publish(&job, start_offset + bytes, bytes, started, (&ids, &counts), expected, false);
            }
        }

        self.drain(&slots).await?;

        if handed < expected {
            let missing = expected - handed;
            tracing::warn!(peer = %job.peer, file = %job.name, missing, "Transfer ended short");
            self.finish_stats(&job.peer);
            return Err(Error::TransferIncomplete { dropped: missing });
        }

        self.send_control(&mut slots, &Frame::Control(Message::FileEnd), &job.peer)?;
        self.publish(&job, start_offset + bytes, bytes, started, (&ids, &counts), expected, true);

        tracing::info!(peer = %job.peer, file = %job.name, chunks = handed, "Transfer complete");
        Ok(SendOutcome {
            total_chunks,
            start_index,
            chunks_sent: handed,
        })
    }

    /// Send a control frame on the lowest-id link that is still open.
    fn send_control(
        &self,
        slots: &mut [Option<Channel>],
        frame: &Frame,
        peer: &EndpointId,
    ) -> Result<()> {
        for slot in slots.iter_mut() {
            let Some(channel) = slot else { continue };
            match channel.send(frame) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(peer = %peer, channel = channel.id(), "Channel lost: {e}");
                    *slot = None;
                }
            }
        }
        Err(Error::ConnectionLost(peer.to_string()))
    }

    /// Returns `Ok(false)` when the chunk was dropped.
    async fn send_chunk(
        &self,
        slot: &mut Option<Channel>,
        index: u64,
        data: Vec<u8>,
    ) -> Result<bool> {
        let Some(channel) = slot.as_ref() else {
            tracing::debug!(index, "Dropped chunk for closed channel");
            return Ok(false);
        };

        while channel.is_open() && channel.buffered_amount() > self.tuning.max_buffered {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::SessionClosed),
                () = tokio::time::sleep(BACKPRESSURE_POLL) => {}
            }
        }

        match channel.send(&Frame::Chunk { index, data }) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(channel = channel.id(), index, "Dropped chunk: {e}");
                *slot = None;
                Ok(false)
            }
        }
    }

    /// Wait until every live link has written out its queue.
    async fn drain(&self, slots: &[Option<Channel>]) -> Result<()> {
        loop {
            let pending = slots
                .iter()
                .flatten()
                .any(|channel| channel.is_open() && channel.buffered_amount() > 0);
            if !pending {
                return Ok(());
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::SessionClosed),
                () = tokio::time::sleep(BACKPRESSURE_POLL) => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        job: &SendJob,
        position: u64,
        bytes_this_run: u64,
        started: Instant,
        (ids, counts): (&[ChannelId], &[u64]),
        expected: u64,
        done: bool,
    ) {
        let (speed_bps, eta) = rate(
            bytes_this_run,
            job.size.saturating_sub(position),
            started.elapsed(),
        );
        let per_channel = expected as f64 / counts.len().max(1) as f64;
        let channels = counts
            .iter()
            .zip(ids)
            .map(|(sent, id)| ChannelShare {
                channel: *id,
                chunks_sent: *sent,
                share: if per_channel > 0.0 {
                    (*sent as f64 / per_channel * 100.0).min(100.0)
                } else {
                    100.0
                },
            })
            .collect();

        let progress = if job.size == 0 {
            if done { 100.0 } else { 0.0 }
        } else {
            (position as f64 / job.size as f64 * 100.0).min(100.0)
        };

        let stats = PeerTransferStats {
            label: job.peer.short_label(),
            file_name: job.name.clone(),
            bytes_sent: position,
            total_bytes: job.size,
            progress,
            speed_bps,
            eta: if done { None } else { eta },
            channels,
            done,
        };
        self.stats.send_modify(|all| {
            all.peers.insert(job.peer.clone(), stats);
        });
    }

    fn finish_stats(&self, peer: &EndpointId) {
        self.stats.send_modify(|all| {
            if let Some(entry) = all.peers.get_mut(peer) {
                entry.done = true;
                entry.eta = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use crate::protocol;
    use crate::transport::BoxedStream;
    use tokio::sync::mpsc;

    struct Harness {
        links: Vec<Channel>,
        remotes: Vec<BoxedStream>,
    }

    fn harness(count: usize) -> Harness {
        let (tx, _rx) = mpsc::channel::<ChannelEvent>(64);
        let mut links = Vec::new();
        let mut remotes = Vec::new();
        for id in 0..count {
            let (ours, theirs) = tokio::io::duplex(8 * 1024 * 1024);
            links.push(Channel::spawn(
                id as u64,
                EndpointId::from_raw("wisp-transfer-v2-rx-abcdef"),
                Box::new(ours),
                tx.clone(),
            ));
            remotes.push(Box::new(theirs) as BoxedStream);
        }
        Harness { links, remotes }
    }

    fn engine(chunk_size: usize) -> (SenderEngine, watch::Receiver<SenderStats>) {
        let (tx, rx) = watch::channel(SenderStats::default());
        let tuning = TransferTuning {
            chunk_size,
            ..TransferTuning::default()
        };
        (SenderEngine::new(tuning, tx, CancellationToken::new()), rx)
    }

    async fn drain_frames(stream: &mut BoxedStream) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Ok(frame)) = tokio::time::timeout(
            Duration::from_millis(100),
            protocol::read_frame(stream),
        )
        .await
        {
            frames.push(frame);
        }
        frames
    }

    fn job(path: PathBuf, size: u64, offset: u64) -> SendJob {
        SendJob {
            peer: EndpointId::from_raw("wisp-transfer-v2-rx-abcdef"),
            file_id: "f1".to_string(),
            path,
            name: "data.bin".to_string(),
            size,
            offset_bytes: offset,
        }
    }

    #[tokio::test]
    async fn test_round_robin_distribution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 1000]).expect("write");

        let Harness { links, mut remotes } = harness(3);
        let (engine, stats) = engine(100);
        let outcome = engine.send(job(path, 1000, 0), links).await.expect("send");
        assert_eq!(outcome.total_chunks, 10);
        assert_eq!(outcome.chunks_sent, 10);

        for (rank, remote) in remotes.iter_mut().enumerate() {
            let frames = drain_frames(remote).await;
            let indices: Vec<u64> = frames
                .iter()
                .filter_map(|frame| match frame {
                    Frame::Chunk { index, .. } => Some(*index),
                    _ => None,
                })
                .collect();
            assert!(indices.iter().all(|i| *i % 3 == rank as u64));
            assert!(indices.len() == 3 || indices.len() == 4);

            if rank == 0 {
                assert!(matches!(frames.first(), Some(Frame::Control(Message::FileStart(_)))));
                assert!(matches!(frames.last(), Some(Frame::Control(Message::FileEnd))));
            }
        }

        let snapshot = stats.borrow().clone();
        let peer = snapshot.peers.values().next().expect("peer stats");
        assert!(peer.done);
        assert_eq!(peer.label, "abcd...");
        assert_eq!(peer.bytes_sent, 1000);
    }

    #[tokio::test]
    async fn test_resume_offset_skips_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![1u8; 1000]).expect("write");

        let Harness { links, mut remotes } = harness(1);
        let (engine, _stats) = engine(100);
        let outcome = engine.send(job(path, 1000, 450), links).await.expect("send");
        assert_eq!(outcome.start_index, 4);
        assert_eq!(outcome.chunks_sent, 6);

        let frames = drain_frames(&mut remotes[0]).await;
        match frames.first() {
            Some(Frame::Control(Message::FileStart(start))) => {
                assert_eq!(start.start_offset, 400);
                assert_eq!(start.total_chunks, 10);
                assert_eq!(start.file_type, "application/octet-stream");
            }
            other => panic!("expected file_start, got {other:?}"),
        }
        assert!(matches!(frames.get(1), Some(Frame::Chunk { index: 4, .. })));
    }

    #[tokio::test]
    async fn test_dead_channel_drops_its_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![2u8; 1000]).expect("write");

        let Harness { links, remotes: _remotes } = harness(2);
        links[1].abort();

        let (engine, _stats) = engine(100);
        let result = engine.send(job(path, 1000, 0), links).await;
        assert!(matches!(result, Err(Error::TransferIncomplete { dropped: 5 })));
    }

    #[tokio::test]
    async fn test_no_links_is_connection_lost() {
        let (engine, _stats) = engine(100);
        let result = engine.send(job(PathBuf::from("x"), 10, 0), Vec::new()).await;
        assert!(matches!(result, Err(Error::ConnectionLost(_))));
    }
}
