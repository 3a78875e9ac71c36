//! Arena of open channels, keyed by channel id.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use super::{Channel, ChannelEvent, ChannelId};
use crate::code::EndpointId;
use crate::error::{Error, Result};
use crate::protocol::{self, Frame, Message};
use crate::security::{AdmissionPolicy, Rejection};
use crate::transport::{InboundStream, Transport};

/// Verification state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No handshake yet
    Unverified,
    /// Handshake accepted, password outstanding
    AwaitingAuth,
    /// Fully verified
    Verified,
}

/// A channel together with its verification state.
#[derive(Debug)]
pub struct PooledChannel {
    /// Channel handle
    pub channel: Channel,
    /// Verification state
    pub state: ChannelState,
}

/// Set of open channels owned by one session.
///
/// Mutation happens only from the owning session loop, one event at a
/// time, so iteration never observes a half-updated pool.
#[derive(Debug)]
pub struct ChannelPool {
    channels: BTreeMap<ChannelId, PooledChannel>,
    next_id: ChannelId,
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelPool {
    /// Create an empty pool reporting to `events`.
    pub fn new(events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            channels: BTreeMap::new(),
            next_id: 1,
            events,
        }
    }

    /// Open `count` channels to `remote`.
    ///
    /// Succeeds only once every channel is open; the channels are then
    /// added in one step, unverified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerUnavailable`] if none opened before `timeout`,
    /// or [`Error::ChannelPoolIncomplete`] if only some did. Channels that
    /// did open are closed again in both cases.
    pub async fn open_channels(
        &mut self,
        transport: &dyn Transport,
        local: &EndpointId,
        remote: &EndpointId,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<ChannelId>> {
        let mut pending: FuturesUnordered<_> =
            (0..count).map(|_| transport.dial(local, remote)).collect();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut opened = Vec::with_capacity(count);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(Ok(stream)) => opened.push(stream),
                    Some(Err(e)) => {
                        tracing::debug!(peer = %remote, "Dial failed: {e}");
                    }
                    None => break,
                },
                () = &mut deadline => {
                    tracing::debug!(peer = %remote, opened = opened.len(), "Channel open deadline reached");
                    break;
                }
            }
        }
        drop(pending);

        if opened.is_empty() {
            return Err(Error::PeerUnavailable(remote.to_string()));
        }
        if opened.len() < count {
            return Err(Error::ChannelPoolIncomplete {
                opened: opened.len(),
                requested: count,
            });
        }

        let ids = opened
            .into_iter()
            .map(|stream| self.insert(remote.clone(), stream, ChannelState::Unverified))
            .collect::<Vec<_>>();

        tracing::info!(peer = %remote, channels = ids.len(), "Channel pool open");
        Ok(ids)
    }

    /// Admit or refuse a stream opened by a remote.
    ///
    /// Refused streams get a courtesy `rejected` frame and are closed; the
    /// refusal never counts as a security failure.
    pub fn on_inbound(
        &mut self,
        inbound: InboundStream,
        policy: &AdmissionPolicy,
    ) -> std::result::Result<ChannelId, Rejection> {
        if let Err(rejection) = policy.admit(self.channels.len()) {
            tracing::warn!(peer = %inbound.remote, %rejection, "Rejected inbound channel");
            tokio::spawn(async move {
                let mut stream = inbound.stream;
                let frame = Frame::Control(Message::Rejected {
                    reason: rejection.to_string(),
                });
                let _ = protocol::write_frame(&mut stream, &frame).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
            });
            return Err(rejection);
        }

        let id = self.insert(inbound.remote, inbound.stream, ChannelState::Unverified);
        Ok(id)
    }

    fn insert(
        &mut self,
        remote: EndpointId,
        stream: crate::transport::BoxedStream,
        state: ChannelState,
    ) -> ChannelId {
        let id = self.next_id;
        self.next_id += 1;
        let channel = Channel::spawn(id, remote, stream, self.events.clone());
        self.channels.insert(id, PooledChannel { channel, state });
        id
    }

    /// Look up a channel.
    pub fn get(&self, id: ChannelId) -> Option<&PooledChannel> {
        self.channels.get(&id)
    }

    /// Verification state of a channel.
    pub fn state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.get(&id).map(|entry| entry.state)
    }

    /// Update the verification state of a channel.
    pub fn set_state(&mut self, id: ChannelId, state: ChannelState) {
        if let Some(entry) = self.channels.get_mut(&id) {
            entry.state = state;
        }
    }

    /// Remove a channel after its close event. Does not close it.
    pub fn remove(&mut self, id: ChannelId) -> Option<PooledChannel> {
        self.channels.remove(&id)
    }

    /// Close and remove one channel.
    pub fn close(&mut self, id: ChannelId) {
        if let Some(entry) = self.channels.remove(&id) {
            entry.channel.close();
        }
    }

    /// Queue a frame on one channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] if the channel is gone.
    pub fn send(&self, id: ChannelId, frame: &Frame) -> Result<()> {
        self.channels
            .get(&id)
            .ok_or_else(|| Error::ConnectionLost(format!("channel {id}")))?
            .channel
            .send(frame)
    }

    /// Open verified channels to `remote`, lowest id first.
    pub fn verified_for(&self, remote: &EndpointId) -> Vec<Channel> {
        self.channels
            .values()
            .filter(|entry| {
                entry.state == ChannelState::Verified
                    && entry.channel.remote() == remote
                    && entry.channel.is_open()
            })
            .map(|entry| entry.channel.clone())
            .collect()
    }

    /// Any open verified channel to `remote`.
    pub fn any_verified(&self, remote: &EndpointId) -> Option<&Channel> {
        self.channels
            .values()
            .find(|entry| {
                entry.state == ChannelState::Verified
                    && entry.channel.remote() == remote
                    && entry.channel.is_open()
            })
            .map(|entry| &entry.channel)
    }

    /// Ids of the channels to `remote` in `state`, lowest first.
    pub fn ids_in_state(&self, remote: &EndpointId, state: ChannelState) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, entry)| entry.state == state && entry.channel.remote() == remote)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Distinct remotes with at least one channel.
    pub fn peers(&self) -> Vec<EndpointId> {
        let mut peers: Vec<EndpointId> = self
            .channels
            .values()
            .map(|entry| entry.channel.remote().clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Close every channel to `remote`. Returns how many were closed.
    pub fn close_peer(&mut self, remote: &EndpointId) -> usize {
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.channel.remote() == remote)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.close(*id);
        }
        ids.len()
    }

    /// Close every channel.
    pub fn close_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.channels) {
            entry.channel.close();
        }
    }

    /// Number of channels in the pool.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
