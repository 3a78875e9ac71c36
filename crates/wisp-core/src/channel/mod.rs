//! Channels and the channel pool.
//!
//! A [`Channel`] wraps one raw stream. Two tasks serve it: a writer draining
//! the outbound queue and a reader decoding frames into [`ChannelEvent`]s on
//! the owning session's queue. The handle is cheap to clone; every clone
//! talks to the same tasks.
//!
//! `buffered_amount` counts bytes queued but not yet written to the stream,
//! and is the backpressure signal the sender engine watches.

mod pool;

pub use pool::{ChannelPool, ChannelState, PooledChannel};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::protocol::{self, Frame, FrameType, HEADER_SIZE};
use crate::transport::BoxedStream;

/// Identifier of a channel within one session. Never reused.
pub type ChannelId = u64;

/// Events a channel reports to its session.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A frame arrived
    Data {
        /// Channel it arrived on
        channel: ChannelId,
        /// Remote endpoint
        remote: EndpointId,
        /// Decoded frame
        frame: Frame,
    },
    /// The channel failed; a `Closed` event follows
    Error {
        /// Failing channel
        channel: ChannelId,
        /// Description of the failure
        error: String,
    },
    /// The channel is gone. Emitted exactly once per channel.
    Closed {
        /// Closed channel
        channel: ChannelId,
        /// Remote endpoint
        remote: EndpointId,
    },
}

enum Outgoing {
    Frame(FrameType, Vec<u8>),
    Close,
}

/// Handle to one open logical channel.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    remote: EndpointId,
    outbound: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    chunks_sent: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

impl Channel {
    /// Start serving `stream` and report its events on `events`.
    pub fn spawn(
        id: ChannelId,
        remote: EndpointId,
        stream: BoxedStream,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let channel = Self {
            id,
            remote,
            outbound,
            buffered: Arc::new(AtomicUsize::new(0)),
            chunks_sent: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(write_loop(channel.clone(), write_half, queue));
        tokio::spawn(read_loop(channel.clone(), read_half, events));

        tracing::debug!(channel = id, remote = %channel.remote, "Channel open");
        channel
    }

    /// Channel id.
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Remote endpoint.
    pub const fn remote(&self) -> &EndpointId {
        &self.remote
    }

    /// Whether the channel still accepts frames.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Bytes queued but not yet written to the stream.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Chunks handed to this channel so far.
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] if the channel is closed, or an
    /// encoding error.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionLost(self.remote.to_string()));
        }

        let (frame_type, payload) = frame.encode()?;
        let size = HEADER_SIZE + payload.len();
        self.buffered.fetch_add(size, Ordering::AcqRel);

        if self
            .outbound
            .send(Outgoing::Frame(frame_type, payload))
            .is_err()
        {
            self.buffered.fetch_sub(size, Ordering::AcqRel);
            self.open.store(false, Ordering::Release);
            return Err(Error::ConnectionLost(self.remote.to_string()));
        }

        if frame_type == FrameType::Chunk {
            self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Close after already queued frames are written.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Outgoing::Close);
        }
    }

    /// Close immediately, discarding queued frames.
    pub fn abort(&self) {
        self.open.store(false, Ordering::Release);
        self.shutdown.cancel();
    }
}

async fn write_loop(
    channel: Channel,
    mut writer: tokio::io::WriteHalf<BoxedStream>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        let item = tokio::select! {
            () = channel.shutdown.cancelled() => break,
            item = queue.recv() => item,
        };

        match item {
            Some(Outgoing::Frame(frame_type, payload)) => {
                let size = HEADER_SIZE + payload.len();
                let written = tokio::select! {
                    () = channel.shutdown.cancelled() => break,
                    result = protocol::write_encoded(&mut writer, frame_type, &payload) => result,
                };
                channel.buffered.fetch_sub(size, Ordering::AcqRel);

                if let Err(e) = written {
                    tracing::debug!(channel = channel.id, "Write failed: {e}");
                    break;
                }
            }
            Some(Outgoing::Close) | None => break,
        }
    }

    channel.open.store(false, Ordering::Release);
    let _ = writer.shutdown().await;
    channel.shutdown.cancel();
    channel.buffered.store(0, Ordering::Release);
}

async fn read_loop(
    channel: Channel,
    mut reader: tokio::io::ReadHalf<BoxedStream>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        let result = tokio::select! {
            () = channel.shutdown.cancelled() => break,
            result = protocol::read_frame(&mut reader) => result,
        };

        match result {
            Ok(frame) => {
                let event = ChannelEvent::Data {
                    channel: channel.id,
                    remote: channel.remote.clone(),
                    frame,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                let _ = events
                    .send(ChannelEvent::Error {
                        channel: channel.id,
                        error: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    channel.open.store(false, Ordering::Release);
    channel.shutdown.cancel();
    let _ = events
        .send(ChannelEvent::Closed {
            channel: channel.id,
            remote: channel.remote.clone(),
        })
        .await;
    tracing::debug!(channel = channel.id, remote = %channel.remote, "Channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn pair() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_frames_flow_between_channels() {
        let (a, b) = pair();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);

        let left = Channel::spawn(1, EndpointId::from_raw("right"), a, tx_a);
        let _right = Channel::spawn(7, EndpointId::from_raw("left"), b, tx_b);

        left.send(&Frame::Control(Message::GetMetadata)).expect("send");
        left.send(&Frame::Chunk {
            index: 3,
            data: vec![1; 10],
        })
        .expect("send");

        match rx_b.recv().await.expect("event") {
            ChannelEvent::Data { channel, frame, .. } => {
                assert_eq!(channel, 7);
                assert_eq!(frame, Frame::Control(Message::GetMetadata));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx_b.recv().await.expect("event") {
            ChannelEvent::Data { frame, .. } => assert_eq!(frame.kind(), "chunk"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(left.chunks_sent(), 1);
    }

    #[tokio::test]
    async fn test_close_is_reported_once_on_both_sides() {
        let (a, b) = pair();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);

        let left = Channel::spawn(1, EndpointId::from_raw("right"), a, tx_a);
        let right = Channel::spawn(2, EndpointId::from_raw("left"), b, tx_b);

        left.close();
        left.close();
        assert!(!left.is_open());
        assert!(left.send(&Frame::Control(Message::FileEnd)).is_err());

        assert!(matches!(
            rx_b.recv().await,
            Some(ChannelEvent::Closed { channel: 2, .. })
        ));
        assert!(matches!(
            rx_a.recv().await,
            Some(ChannelEvent::Closed { channel: 1, .. })
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!right.is_open());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_garbage_reports_error_then_close() {
        let (a, mut raw) = pair();
        let (tx, mut rx) = mpsc::channel(16);
        let _channel = Channel::spawn(5, EndpointId::from_raw("x"), a, tx);

        raw.write_all(b"NOT A FRAME").await.expect("write");

        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Error { channel: 5, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Closed { channel: 5, .. })
        ));
    }
}
