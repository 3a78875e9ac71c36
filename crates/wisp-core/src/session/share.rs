//! Sending side: hosts files under one share code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{recv_reply, SessionConfig, EVENT_CAPACITY, QUEUE_DEPTH};
use crate::channel::{ChannelEvent, ChannelId, ChannelPool, ChannelState};
use crate::code::{CodeGenerator, EndpointId, ShareCode};
use crate::error::{Error, Result};
use crate::file;
use crate::protocol::{FileDescriptor, Frame, Message};
use crate::security::{AdmissionPolicy, SecurityLog};
use crate::transfer::{SendJob, SendOutcome, SenderEngine, SenderStats};
use crate::transport::{Endpoint, InboundStream, Transport};

/// A file offered by a sharing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostedFile {
    /// Unique id, sent to receivers
    pub id: String,
    /// File on disk
    pub path: PathBuf,
    /// Name offered to receivers
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Share code the file is reachable under
    pub code: ShareCode,
    /// Display URL derived from the code
    pub url: String,
    /// Not available before this instant
    pub available_from: Option<DateTime<Utc>>,
    /// Downloads started so far
    pub downloads: u64,
}

impl HostedFile {
    fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
        }
    }

    /// Whole seconds until the file becomes available, rounded up.
    fn wait_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let from = self.available_from?;
        let remaining = from.signed_duration_since(now).num_milliseconds();
        if remaining <= 0 {
            return None;
        }
        u64::try_from(remaining).ok().map(|ms| ms.div_ceil(1000))
    }
}

/// Point-in-time view of a sharing session.
#[derive(Debug, Clone, Serialize)]
pub struct ShareSnapshot {
    /// Active share code
    pub code: ShareCode,
    /// Share URL of the active code
    pub url: String,
    /// Published endpoint id
    pub endpoint: EndpointId,
    /// Session password, if one is required
    pub password: Option<String>,
    /// Whether the room is locked
    pub locked: bool,
    /// Hosted files
    pub files: Vec<HostedFile>,
    /// Connected peers
    pub peers: Vec<EndpointId>,
    /// Open channels
    pub channels: usize,
    /// Failures currently inside the security window
    pub recent_failures: usize,
}

/// Notifications from a sharing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    /// A peer passed verification on its first channel
    PeerVerified {
        /// The peer
        peer: EndpointId,
    },
    /// Every channel of a peer closed
    PeerLeft {
        /// The peer
        peer: EndpointId,
    },
    /// A wrong password was submitted
    AuthFailed {
        /// The peer
        peer: EndpointId,
    },
    /// A channel broke the verification protocol and was closed
    ProtocolViolation {
        /// The peer
        peer: EndpointId,
        /// What happened
        reason: String,
    },
    /// An inbound channel was refused
    InboundRejected {
        /// The peer
        peer: EndpointId,
        /// Why
        reason: String,
    },
    /// A peer asked for a file that is not available yet
    Scheduled {
        /// The peer
        peer: EndpointId,
        /// The file
        file_id: String,
        /// Seconds until availability
        seconds: u64,
    },
    /// A file started streaming to a peer
    TransferStarted {
        /// The peer
        peer: EndpointId,
        /// The file
        file_id: String,
        /// Resume offset
        offset: u64,
    },
    /// A file finished streaming
    TransferFinished {
        /// The peer
        peer: EndpointId,
        /// The file
        file_id: String,
    },
    /// A stream ended early
    TransferFailed {
        /// The peer
        peer: EndpointId,
        /// The file
        file_id: String,
        /// What went wrong
        error: String,
    },
    /// The room was locked
    RoomLocked,
    /// The room was unlocked
    RoomUnlocked,
    /// The identity rotated after repeated failures
    IdentityRotated {
        /// Retired code
        previous: ShareCode,
        /// New code
        code: ShareCode,
        /// New share URL
        url: String,
    },
    /// The session stopped on an unrecoverable error
    Fatal {
        /// What went wrong
        error: String,
    },
}

enum ShareCommand {
    AddFile {
        path: PathBuf,
        name: Option<String>,
        available_from: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<HostedFile>>,
    },
    RemoveFile {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Schedule {
        id: String,
        available_from: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetLocked {
        locked: bool,
        reply: oneshot::Sender<()>,
    },
    DisconnectPeer {
        peer: EndpointId,
        reply: oneshot::Sender<usize>,
    },
    Rotate {
        reply: oneshot::Sender<Result<ShareCode>>,
    },
    Snapshot {
        reply: oneshot::Sender<ShareSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type SendResult = (EndpointId, String, Result<SendOutcome>);

/// The sharing session actor.
pub struct ShareSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    generator: CodeGenerator,
    code: ShareCode,
    endpoint: Endpoint,
    pool: ChannelPool,
    channel_events: mpsc::Receiver<ChannelEvent>,
    admission: AdmissionPolicy,
    security: SecurityLog,
    files: Vec<HostedFile>,
    verified_peers: Vec<EndpointId>,
    sends: JoinSet<SendResult>,
    send_tokens: HashMap<EndpointId, CancellationToken>,
    stats: watch::Sender<SenderStats>,
    events: broadcast::Sender<ShareEvent>,
    commands: mpsc::Receiver<ShareCommand>,
    shutdown: CancellationToken,
}

impl ShareSession {
    /// Publish a fresh identity and start the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityExhausted`] if no free code was found, or
    /// the transport's registration error.
    pub async fn start(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<ShareHandle> {
        let generator = CodeGenerator::new();
        let (code, endpoint) = register_identity(transport.as_ref(), &generator, None).await?;

        let (event_tx, channel_events) = mpsc::channel(QUEUE_DEPTH);
        let (command_tx, commands) = mpsc::channel(QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stats, stats_rx) = watch::channel(SenderStats::default());

        tracing::info!(code = %code, endpoint = %endpoint.id(), "Sharing session started");

        let session = Self {
            transport,
            admission: AdmissionPolicy::new(config.parallel_channels, config.channel_slack),
            security: SecurityLog::new(config.failure_window, config.failure_threshold),
            config,
            generator,
            code,
            endpoint,
            pool: ChannelPool::new(event_tx),
            channel_events,
            files: Vec::new(),
            verified_peers: Vec::new(),
            sends: JoinSet::new(),
            send_tokens: HashMap::new(),
            stats,
            events: events.clone(),
            commands,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(session.run());

        Ok(ShareHandle {
            commands: command_tx,
            events,
            stats: stats_rx,
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.on_command(command).await {
                        break;
                    }
                }
                inbound = self.endpoint.accept() => {
                    let Some(inbound) = inbound else {
                        tracing::warn!(endpoint = %self.endpoint.id(), "Endpoint stopped accepting");
                        self.emit(ShareEvent::Fatal {
                            error: "endpoint closed".to_string(),
                        });
                        break;
                    };
                    self.on_inbound(inbound);
                }
                Some(event) = self.channel_events.recv() => {
                    if let Err(e) = self.on_channel_event(event).await {
                        tracing::error!("Sharing session stopped: {e}");
                        self.emit(ShareEvent::Fatal { error: e.to_string() });
                        break;
                    }
                }
                Some(joined) = self.sends.join_next(), if !self.sends.is_empty() => {
                    match joined {
                        Ok(result) => self.on_send_finished(result),
                        Err(e) => tracing::error!("Send task failed: {e}"),
                    }
                }
            }
        }

        self.shutdown.cancel();
        self.pool.close_all();
        self.sends.shutdown().await;
        tracing::info!(code = %self.code, "Sharing session closed");
    }

    /// Returns `false` when the session should stop.
    async fn on_command(&mut self, command: ShareCommand) -> bool {
        match command {
            ShareCommand::AddFile {
                path,
                name,
                available_from,
                reply,
            } => {
                let _ = reply.send(self.add_file(path, name, available_from).await);
            }
            ShareCommand::RemoveFile { id, reply } => {
                let before = self.files.len();
                self.files.retain(|hosted| hosted.id != id);
                let result = if self.files.len() < before {
                    Ok(())
                } else {
                    Err(Error::UnknownFile(id))
                };
                let _ = reply.send(result);
            }
            ShareCommand::Schedule {
                id,
                available_from,
                reply,
            } => {
                let result = match self.files.iter_mut().find(|hosted| hosted.id == id) {
                    Some(hosted) => {
                        hosted.available_from = available_from;
                        Ok(())
                    }
                    None => Err(Error::UnknownFile(id)),
                };
                let _ = reply.send(result);
            }
            ShareCommand::SetLocked { locked, reply } => {
                self.set_locked(locked);
                let _ = reply.send(());
            }
            ShareCommand::DisconnectPeer { peer, reply } => {
                let closed = self.disconnect(&peer);
                let _ = reply.send(closed);
            }
            ShareCommand::Rotate { reply } => {
                let result = self.rotate().await;
                let stop = result.is_err();
                let _ = reply.send(result);
                if stop {
                    return false;
                }
            }
            ShareCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ShareCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn add_file(
        &mut self,
        path: PathBuf,
        name: Option<String>,
        available_from: Option<DateTime<Utc>>,
    ) -> Result<HostedFile> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        let name = self.unique_name(name.unwrap_or_else(|| file::base_name(&path)));

        let hosted = HostedFile {
            id: Uuid::new_v4().to_string(),
            path,
            name,
            size: metadata.len(),
            code: self.code.clone(),
            url: self.code.share_url(&self.config.origin),
            available_from,
            downloads: 0,
        };
        tracing::info!(file = %hosted.name, size = hosted.size, code = %self.code, "Hosting file");
        self.files.push(hosted.clone());
        Ok(hosted)
    }

    /// `name`, or `name (N)` when another hosted file already uses it.
    fn unique_name(&self, name: String) -> String {
        let taken = |candidate: &str| self.files.iter().any(|f| f.name == candidate);
        if !taken(&name) {
            return name;
        }

        let (stem, ext) = match name.rfind('.') {
            Some(dot) if dot > 0 && !name[dot..].contains('/') => name.split_at(dot),
            _ => (name.as_str(), ""),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{stem} ({n}){ext}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn set_locked(&mut self, locked: bool) {
        if locked == self.admission.is_locked() {
            return;
        }
        if locked {
            self.admission.lock();
            tracing::info!("Room locked");
            self.emit(ShareEvent::RoomLocked);
        } else {
            self.admission.unlock();
            tracing::info!("Room unlocked");
            self.emit(ShareEvent::RoomUnlocked);
        }
    }

    fn disconnect(&mut self, peer: &EndpointId) -> usize {
        if let Some(token) = self.send_tokens.remove(peer) {
            token.cancel();
        }
        let closed = self.pool.close_peer(peer);
        if closed > 0 {
            tracing::info!(peer = %peer, channels = closed, "Disconnected peer");
            self.forget_peer(peer);
        }
        closed
    }

    fn forget_peer(&mut self, peer: &EndpointId) {
        let before = self.verified_peers.len();
        self.verified_peers.retain(|known| known != peer);
        if self.verified_peers.len() < before {
            self.emit(ShareEvent::PeerLeft { peer: peer.clone() });
        }
    }

    /// Destroy the endpoint and continue under a fresh code.
    async fn rotate(&mut self) -> Result<ShareCode> {
        for (_, token) in self.send_tokens.drain() {
            token.cancel();
        }
        self.pool.close_all();
        for peer in std::mem::take(&mut self.verified_peers) {
            self.emit(ShareEvent::PeerLeft { peer });
        }
        self.security.reset();

        let (code, endpoint) =
            register_identity(self.transport.as_ref(), &self.generator, Some(&self.code)).await?;
        let previous = std::mem::replace(&mut self.code, code.clone());
        self.endpoint = endpoint;

        let url = code.share_url(&self.config.origin);
        for hosted in &mut self.files {
            hosted.code = code.clone();
            hosted.url.clone_from(&url);
        }

        tracing::info!(previous = %previous, code = %code, "Identity rotated");
        self.emit(ShareEvent::IdentityRotated {
            previous,
            code: code.clone(),
            url,
        });
        Ok(code)
    }

    fn snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            code: self.code.clone(),
            url: self.code.share_url(&self.config.origin),
            endpoint: self.endpoint.id().clone(),
            password: self.config.password.password().map(str::to_string),
            locked: self.admission.is_locked(),
            files: self.files.clone(),
            peers: self.pool.peers(),
            channels: self.pool.len(),
            recent_failures: self.security.len(),
        }
    }

    fn on_inbound(&mut self, inbound: InboundStream) {
        let peer = inbound.remote.clone();
        match self.pool.on_inbound(inbound, &self.admission) {
            Ok(channel) => {
                tracing::debug!(peer = %peer, channel, "Accepted inbound channel");
            }
            Err(rejection) => {
                self.emit(ShareEvent::InboundRejected {
                    peer,
                    reason: rejection.to_string(),
                });
            }
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Data {
                channel,
                remote,
                frame,
            } => {
                let Some(state) = self.pool.state(channel) else {
                    return Ok(());
                };
                match frame {
                    Frame::Control(message) => {
                        self.on_message(channel, &remote, state, message).await?;
                    }
                    other if state != ChannelState::Verified => {
                        let reason = format!("{} frame before verification", other.kind());
                        self.violation(channel, &remote, reason).await?;
                    }
                    other => {
                        tracing::debug!(peer = %remote, kind = other.kind(), "Ignoring frame");
                    }
                }
            }
            ChannelEvent::Error { channel, error } => {
                let Some(entry) = self.pool.get(channel) else {
                    return Ok(());
                };
                if entry.state == ChannelState::Verified {
                    tracing::debug!(channel, "Channel error: {error}");
                } else {
                    let remote = entry.channel.remote().clone();
                    let reason = format!("undecodable frame before verification: {error}");
                    self.violation(channel, &remote, reason).await?;
                }
            }
            ChannelEvent::Closed { channel, remote } => {
                if self.pool.remove(channel).is_some() && !self.pool.peers().contains(&remote) {
                    if let Some(token) = self.send_tokens.remove(&remote) {
                        token.cancel();
                    }
                    self.forget_peer(&remote);
                }
            }
        }
        Ok(())
    }

    async fn on_message(
        &mut self,
        channel: ChannelId,
        remote: &EndpointId,
        state: ChannelState,
        message: Message,
    ) -> Result<()> {
        match (state, message) {
            (ChannelState::Unverified, Message::Handshake { version }) => {
                if version != crate::PROTOCOL_VERSION {
                    let reason = format!("version mismatch: {version}");
                    return self.violation(channel, remote, reason).await;
                }
                if self.config.password.is_required() {
                    self.pool.set_state(channel, ChannelState::AwaitingAuth);
                    self.reply(channel, Message::AuthRequired);
                } else {
                    self.verify(channel, remote);
                }
            }
            (ChannelState::AwaitingAuth, Message::Handshake { .. }) => {
                self.reply(channel, Message::AuthRequired);
            }
            (ChannelState::AwaitingAuth, Message::Auth { password }) => {
                if self.config.password.verify(&password) {
                    self.verify(channel, remote);
                } else {
                    tracing::warn!(peer = %remote, channel, "Wrong password");
                    self.reply(channel, Message::AuthError);
                    self.emit(ShareEvent::AuthFailed {
                        peer: remote.clone(),
                    });
                    self.record_failure().await?;
                }
            }
            (ChannelState::Verified, Message::Handshake { .. } | Message::Auth { .. }) => {
                self.reply(channel, Message::HandshakeOk);
            }
            (ChannelState::Verified, Message::GetMetadata) => {
                let files = self.files.iter().map(HostedFile::descriptor).collect();
                self.reply(channel, Message::MetadataList { files });
            }
            (
                ChannelState::Verified,
                Message::RequestFile {
                    file_id,
                    offset_bytes,
                },
            ) => {
                self.on_request_file(channel, remote, file_id.as_deref(), offset_bytes);
            }
            (ChannelState::Verified, other) => {
                tracing::debug!(peer = %remote, kind = other.kind(), "Ignoring message");
            }
            (_, other) => {
                let reason = format!("{} before verification", other.kind());
                return self.violation(channel, remote, reason).await;
            }
        }
        Ok(())
    }

    fn verify(&mut self, channel: ChannelId, remote: &EndpointId) {
        self.pool.set_state(channel, ChannelState::Verified);
        self.reply(channel, Message::HandshakeOk);

        if !self.verified_peers.contains(remote) {
            tracing::info!(peer = %remote, "Peer verified");
            self.verified_peers.push(remote.clone());
            self.emit(ShareEvent::PeerVerified {
                peer: remote.clone(),
            });
        }
    }

    fn on_request_file(
        &mut self,
        channel: ChannelId,
        remote: &EndpointId,
        file_id: Option<&str>,
        offset_bytes: u64,
    ) {
        let hosted = match file_id {
            Some(id) => self.files.iter_mut().find(|hosted| hosted.id == id),
            None => self.files.first_mut(),
        };
        let Some(hosted) = hosted else {
            tracing::warn!(peer = %remote, file = ?file_id, "Request for unknown file");
            self.reply(
                channel,
                Message::Rejected {
                    reason: "unknown file".to_string(),
                },
            );
            return;
        };

        if let Some(seconds) = hosted.wait_seconds(Utc::now()) {
            let file_id = hosted.id.clone();
            tracing::debug!(peer = %remote, file = %hosted.name, seconds, "File not available yet");
            self.reply(channel, Message::ScheduleWait { seconds });
            self.emit(ShareEvent::Scheduled {
                peer: remote.clone(),
                file_id,
                seconds,
            });
            return;
        }

        hosted.downloads += 1;
        let job = SendJob {
            peer: remote.clone(),
            file_id: hosted.id.clone(),
            path: hosted.path.clone(),
            name: hosted.name.clone(),
            size: hosted.size,
            offset_bytes: offset_bytes.min(hosted.size),
        };

        if let Some(previous) = self.send_tokens.remove(remote) {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        self.send_tokens.insert(remote.clone(), token.clone());

        let links = self.pool.verified_for(remote);
        let engine = SenderEngine::new(self.config.tuning, self.stats.clone(), token);
        self.emit(ShareEvent::TransferStarted {
            peer: remote.clone(),
            file_id: job.file_id.clone(),
            offset: job.offset_bytes,
        });

        self.sends.spawn(async move {
            let peer = job.peer.clone();
            let file_id = job.file_id.clone();
            let result = engine.send(job, links).await;
            (peer, file_id, result)
        });

        if self.config.lock_on_transfer {
            self.set_locked(true);
        }
    }

    fn on_send_finished(&mut self, (peer, file_id, result): SendResult) {
        match result {
            Ok(_) => {
                self.emit(ShareEvent::TransferFinished { peer, file_id });
            }
            Err(Error::SessionClosed) => {
                tracing::debug!(peer = %peer, file = %file_id, "Send cancelled");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, file = %file_id, "Send failed: {e}");
                self.emit(ShareEvent::TransferFailed {
                    peer,
                    file_id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn reply(&self, channel: ChannelId, message: Message) {
        if let Err(e) = self.pool.send(channel, &Frame::Control(message)) {
            tracing::debug!(channel, "Reply not sent: {e}");
        }
    }

    async fn violation(
        &mut self,
        channel: ChannelId,
        remote: &EndpointId,
        reason: String,
    ) -> Result<()> {
        tracing::warn!(peer = %remote, channel, %reason, "Protocol violation");
        self.pool.close(channel);
        self.emit(ShareEvent::ProtocolViolation {
            peer: remote.clone(),
            reason,
        });
        self.record_failure().await
    }

    async fn record_failure(&mut self) -> Result<()> {
        if self.security.record_failure(Instant::now()) {
            tracing::warn!(code = %self.code, "Failure threshold reached, rotating identity");
            self.rotate().await?;
        }
        Ok(())
    }

    fn emit(&self, event: ShareEvent) {
        let _ = self.events.send(event);
    }
}

/// Publish an identity under a fresh code, retrying on collisions.
async fn register_identity(
    transport: &dyn Transport,
    generator: &CodeGenerator,
    previous: Option<&ShareCode>,
) -> Result<(ShareCode, Endpoint)> {
    let attempts = crate::IDENTITY_RETRIES + 1;
    for attempt in 1..=attempts {
        let code = match previous {
            Some(previous) => generator.generate_other(previous),
            None => generator.generate(),
        };
        match transport.register(&EndpointId::for_code(&code)).await {
            Ok(endpoint) => return Ok((code, endpoint)),
            Err(Error::EndpointTaken(id)) => {
                tracing::debug!(attempt, endpoint = %id, "Endpoint id taken, regenerating");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::IdentityExhausted(attempts))
}

/// Handle to a running [`ShareSession`].
#[derive(Debug, Clone)]
pub struct ShareHandle {
    commands: mpsc::Sender<ShareCommand>,
    events: broadcast::Sender<ShareEvent>,
    stats: watch::Receiver<SenderStats>,
}

impl ShareHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ShareCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        recv_reply(rx).await
    }

    /// Host one file, optionally not before `available_from`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if `path` is not a readable file.
    pub async fn add_file(
        &self,
        path: PathBuf,
        available_from: Option<DateTime<Utc>>,
    ) -> Result<HostedFile> {
        self.request(|reply| ShareCommand::AddFile {
            path,
            name: None,
            available_from,
            reply,
        })
        .await?
    }

    /// Host a file, or every regular file beneath a directory.
    ///
    /// Files found in a directory are offered under their path relative to
    /// it, so `x/pic.jpg` and `y/pic.jpg` stay apart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if the path does not exist.
    pub async fn add_path(
        &self,
        path: PathBuf,
        available_from: Option<DateTime<Utc>>,
    ) -> Result<Vec<HostedFile>> {
        let files = tokio::task::spawn_blocking(move || file::enumerate_files(&[path]))
            .await
            .map_err(|e| Error::Internal(format!("file enumeration failed: {e}")))??;

        let mut hosted = Vec::with_capacity(files.len());
        for shared in files {
            let added = self
                .request(|reply| ShareCommand::AddFile {
                    path: shared.path,
                    name: Some(shared.name),
                    available_from,
                    reply,
                })
                .await??;
            hosted.push(added);
        }
        Ok(hosted)
    }

    /// Stop hosting a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFile`] if no such file is hosted.
    pub async fn remove_file(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| ShareCommand::RemoveFile { id, reply })
            .await?
    }

    /// Set or clear a file's availability instant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFile`] if no such file is hosted.
    pub async fn schedule(&self, id: &str, available_from: Option<DateTime<Utc>>) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| ShareCommand::Schedule {
            id,
            available_from,
            reply,
        })
        .await?
    }

    /// Refuse all new inbound channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn lock_room(&self) -> Result<()> {
        self.request(|reply| ShareCommand::SetLocked {
            locked: true,
            reply,
        })
        .await
    }

    /// Accept new inbound channels again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn unlock_room(&self) -> Result<()> {
        self.request(|reply| ShareCommand::SetLocked {
            locked: false,
            reply,
        })
        .await
    }

    /// Close every channel of one peer. Returns how many were closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn disconnect_peer(&self, peer: &EndpointId) -> Result<usize> {
        let peer = peer.clone();
        self.request(|reply| ShareCommand::DisconnectPeer { peer, reply })
            .await
    }

    /// Rotate the identity now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityExhausted`] if no free code was found; the
    /// session stops in that case.
    pub async fn rotate(&self) -> Result<ShareCode> {
        self.request(|reply| ShareCommand::Rotate { reply }).await?
    }

    /// Current state of the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn snapshot(&self) -> Result<ShareSnapshot> {
        self.request(|reply| ShareCommand::Snapshot { reply }).await
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// Watch per-peer transfer progress.
    pub fn sender_stats(&self) -> watch::Receiver<SenderStats> {
        self.stats.clone()
    }

    /// Stop the session and close every channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ShareCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_seconds_rounds_up() {
        let now = Utc::now();
        let mut hosted = HostedFile {
            id: "f".to_string(),
            path: PathBuf::from("f"),
            name: "f".to_string(),
            size: 1,
            code: ShareCode::parse("123456").expect("code"),
            url: String::new(),
            available_from: None,
            downloads: 0,
        };
        assert_eq!(hosted.wait_seconds(now), None);

        hosted.available_from = Some(now + chrono::Duration::milliseconds(2100));
        assert_eq!(hosted.wait_seconds(now), Some(3));

        hosted.available_from = Some(now - chrono::Duration::seconds(1));
        assert_eq!(hosted.wait_seconds(now), None);
    }

    #[tokio::test]
    async fn test_identity_exhaustion() {
        struct Crowded;

        impl Transport for Crowded {
            fn register<'a>(
                &'a self,
                id: &'a EndpointId,
            ) -> futures::future::BoxFuture<'a, Result<Endpoint>> {
                Box::pin(async move { Err(Error::EndpointTaken(id.to_string())) })
            }

            fn dial<'a>(
                &'a self,
                _local: &'a EndpointId,
                remote: &'a EndpointId,
            ) -> futures::future::BoxFuture<'a, Result<crate::transport::BoxedStream>> {
                Box::pin(async move { Err(Error::PeerUnavailable(remote.to_string())) })
            }
        }

        let result = register_identity(&Crowded, &CodeGenerator::new(), None).await;
        assert!(matches!(
            result,
            Err(Error::IdentityExhausted(n)) if n == crate::IDENTITY_RETRIES + 1
        ));
    }
}
