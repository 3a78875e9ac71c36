//! Receiving side: connects to one share code and downloads its files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{recv_reply, sleep_until_opt, SessionConfig, EVENT_CAPACITY, QUEUE_DEPTH};
use crate::channel::{ChannelEvent, ChannelId, ChannelPool, ChannelState};
use crate::code::{EndpointId, ShareCode};
use crate::error::{Error, Result};
use crate::file::Destination;
use crate::protocol::{Frame, Message};
use crate::security::HumanCheck;
use crate::transfer::{
    CompletedFile, IncomingFile, ReceiverEngine, ReceiverState, ResumeCheckpoint, TransferProgress,
};
use crate::transport::Transport;

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Verified; the sender's catalog
    Ready(Vec<IncomingFile>),
    /// The sender wants a password, see [`ReceiveHandle::submit_password`]
    PasswordRequired,
}

/// Notifications from a receive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// The channel pool opened
    Connected {
        /// The sender
        peer: EndpointId,
        /// Channels opened
        channels: usize,
    },
    /// The sender asked for a password
    PasswordRequired,
    /// The submitted password was rejected
    AuthFailed,
    /// Every channel passed verification
    Verified,
    /// A new catalog replaced the old one
    CatalogUpdated {
        /// The catalog
        files: Vec<IncomingFile>,
    },
    /// The requested file is not available yet
    Scheduled {
        /// Seconds until the request is repeated
        seconds: u64,
    },
    /// A download started
    DownloadStarted {
        /// The file
        file_id: String,
        /// Resume offset requested
        offset: u64,
    },
    /// A download finished
    DownloadFinished {
        /// The file
        file: CompletedFile,
    },
    /// A download stopped early
    DownloadFailed {
        /// What went wrong
        error: String,
    },
    /// The sender refused a channel or a request
    Rejected {
        /// The sender's reason
        reason: String,
    },
    /// Every channel to the sender closed
    Disconnected,
    /// Too many unreachable codes; answer this before connecting again
    HumanCheckRequired {
        /// Arithmetic question
        question: String,
    },
}

enum ReceiveCommand {
    Connect {
        code: ShareCode,
        password: Option<String>,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    },
    SubmitPassword {
        password: String,
        reply: oneshot::Sender<Result<Vec<IncomingFile>>>,
    },
    Resume {
        checkpoint: Option<ResumeCheckpoint>,
        password: Option<String>,
        reply: oneshot::Sender<Result<CompletedFile>>,
    },
    Download {
        file_id: String,
        destination: Destination,
        reply: oneshot::Sender<Result<CompletedFile>>,
    },
    Catalog {
        reply: oneshot::Sender<Vec<IncomingFile>>,
    },
    State {
        reply: oneshot::Sender<ReceiverState>,
    },
    HumanChallenge {
        reply: oneshot::Sender<Option<String>>,
    },
    SolveHumanCheck {
        answer: String,
        reply: oneshot::Sender<bool>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Callers waiting on the actor.
#[derive(Default)]
struct Waiters {
    connect: Option<oneshot::Sender<Result<ConnectOutcome>>>,
    password: Option<oneshot::Sender<Result<Vec<IncomingFile>>>>,
    download: Option<oneshot::Sender<Result<CompletedFile>>>,
}

impl Waiters {
    fn fail_all(&mut self, error: impl Fn() -> Error) {
        if let Some(reply) = self.connect.take() {
            let _ = reply.send(Err(error()));
        }
        if let Some(reply) = self.password.take() {
            let _ = reply.send(Err(error()));
        }
        if let Some(reply) = self.download.take() {
            let _ = reply.send(Err(error()));
        }
    }
}

/// Password negotiation with the sender.
#[derive(Debug, Default)]
struct AuthState {
    candidate: Option<String>,
    in_flight: Option<ChannelId>,
    accepted: bool,
}

/// The receive session actor.
pub struct ReceiveSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    local: EndpointId,
    remote: Option<EndpointId>,
    pool: ChannelPool,
    channel_events: mpsc::Receiver<ChannelEvent>,
    engine: ReceiverEngine,
    human: HumanCheck,
    auth: AuthState,
    verified: bool,
    resume: Option<ResumeCheckpoint>,
    waiters: Waiters,
    schedule_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    events: broadcast::Sender<ReceiveEvent>,
    commands: mpsc::Receiver<ReceiveCommand>,
}

impl ReceiveSession {
    /// Start an idle receive session under a throwaway endpoint id.
    pub fn start(transport: Arc<dyn Transport>, config: SessionConfig) -> ReceiveHandle {
        let (event_tx, channel_events) = mpsc::channel(QUEUE_DEPTH);
        let (command_tx, commands) = mpsc::channel(QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = ReceiverEngine::new(config.tuning, config.resume_store());
        let progress = engine.progress();

        let session = Self {
            transport,
            local: EndpointId::ephemeral(),
            remote: None,
            pool: ChannelPool::new(event_tx),
            channel_events,
            engine,
            human: HumanCheck::new(config.human_check_threshold),
            config,
            auth: AuthState::default(),
            verified: false,
            resume: None,
            waiters: Waiters::default(),
            schedule_deadline: None,
            grace_deadline: None,
            events: events.clone(),
            commands,
        };
        tokio::spawn(session.run());

        ReceiveHandle {
            commands: command_tx,
            events,
            progress,
        }
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
                Some(event) = self.channel_events.recv() => {
                    self.on_channel_event(event).await;
                }
                () = sleep_until_opt(self.schedule_deadline) => {
                    self.schedule_deadline = None;
                    self.on_schedule_elapsed();
                }
                () = sleep_until_opt(self.grace_deadline) => {
                    self.grace_deadline = None;
                    let result = self.engine.on_end_grace_elapsed().await;
                    self.settle_download(result);
                }
            }
        }

        self.disconnect().await;
        self.waiters.fail_all(|| Error::SessionClosed);
        tracing::debug!(endpoint = %self.local, "Receive session closed");
    }

    /// Returns `false` when the session should stop.
    async fn on_command(&mut self, command: ReceiveCommand) -> bool {
        match command {
            ReceiveCommand::Connect {
                code,
                password,
                reply,
            } => {
                if let Err(e) = self.open(&code, password).await {
                    let _ = reply.send(Err(e));
                } else {
                    self.waiters.connect = Some(reply);
                }
            }
            ReceiveCommand::SubmitPassword { password, reply } => {
                self.submit_password(password, reply);
            }
            ReceiveCommand::Resume {
                checkpoint,
                password,
                reply,
            } => {
                if let Err(e) = self.resume(checkpoint, password).await {
                    let _ = reply.send(Err(e));
                } else {
                    self.waiters.download = Some(reply);
                }
            }
            ReceiveCommand::Download {
                file_id,
                destination,
                reply,
            } => match self.download(&file_id, destination).await {
                Ok(offset) => {
                    self.waiters.download = Some(reply);
                    self.emit(ReceiveEvent::DownloadStarted { file_id, offset });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ReceiveCommand::Catalog { reply } => {
                let _ = reply.send(self.engine.catalog().to_vec());
            }
            ReceiveCommand::State { reply } => {
                let _ = reply.send(self.engine.state());
            }
            ReceiveCommand::HumanChallenge { reply } => {
                let _ = reply.send(self.human.challenge().map(|c| c.question()));
            }
            ReceiveCommand::SolveHumanCheck { answer, reply } => {
                let cleared = self.human.solve(&answer);
                if !cleared {
                    if let Some(challenge) = self.human.challenge() {
                        let question = challenge.question();
                        self.emit(ReceiveEvent::HumanCheckRequired { question });
                    }
                }
                let _ = reply.send(cleared);
            }
            ReceiveCommand::Reset { reply } => {
                self.disconnect().await;
                self.waiters.fail_all(|| Error::SessionClosed);
                self.engine.reset().await;
                let _ = reply.send(());
            }
            ReceiveCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Open the channel pool to `code` and send `handshake` on every channel.
    async fn open(&mut self, code: &ShareCode, password: Option<String>) -> Result<()> {
        self.human.ensure_clear()?;
        if matches!(
            self.engine.state(),
            ReceiverState::Downloading | ReceiverState::Scheduled
        ) {
            return Err(Error::InvalidState(
                "a download is still running".to_string(),
            ));
        }

        self.disconnect().await;
        self.engine.clear_catalog();

        let remote = EndpointId::for_code(code);
        let opened = self
            .pool
            .open_channels(
                self.transport.as_ref(),
                &self.local,
                &remote,
                self.config.parallel_channels,
                self.config.open_timeout,
            )
            .await;

        let ids = match opened {
            Ok(ids) => ids,
            Err(e @ Error::PeerUnavailable(_)) => {
                tracing::warn!(code = %code, "Share code unreachable");
                if let Some(challenge) = self.human.record_unreachable() {
                    let question = challenge.question();
                    self.emit(ReceiveEvent::HumanCheckRequired { question });
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.human.record_success();

        self.auth = AuthState {
            candidate: password,
            ..AuthState::default()
        };
        self.remote = Some(remote.clone());

        let handshake = Frame::Control(Message::Handshake {
            version: crate::PROTOCOL_VERSION.to_string(),
        });
        for id in &ids {
            if let Err(e) = self.pool.send(*id, &handshake) {
                tracing::debug!(channel = id, "Handshake not sent: {e}");
            }
        }

        tracing::info!(peer = %remote, channels = ids.len(), "Connected");
        self.emit(ReceiveEvent::Connected {
            peer: remote,
            channels: ids.len(),
        });
        Ok(())
    }

    fn submit_password(
        &mut self,
        password: String,
        reply: oneshot::Sender<Result<Vec<IncomingFile>>>,
    ) {
        if self.verified {
            let _ = reply.send(Ok(self.engine.catalog().to_vec()));
            return;
        }
        if self.auth.in_flight.is_some() {
            let _ = reply.send(Err(Error::InvalidState(
                "a password check is in progress".to_string(),
            )));
            return;
        }
        let waiting = self
            .channels_in_state(ChannelState::AwaitingAuth)
            .into_iter()
            .next();
        let Some(channel) = waiting else {
            let _ = reply.send(Err(Error::InvalidState(
                "no password was requested".to_string(),
            )));
            return;
        };

        self.auth.candidate = Some(password.clone());
        self.send_auth(channel, password);
        self.waiters.password = Some(reply);
    }

    async fn resume(
        &mut self,
        checkpoint: Option<ResumeCheckpoint>,
        password: Option<String>,
    ) -> Result<()> {
        let checkpoint = match checkpoint {
            Some(checkpoint) => checkpoint,
            None => self
                .engine
                .store()
                .load()
                .await?
                .ok_or_else(|| Error::InvalidState("nothing to resume".to_string()))?,
        };
        let code = checkpoint.peer_id.code().ok_or_else(|| {
            Error::ResumeMismatch(format!("unknown sender id {}", checkpoint.peer_id))
        })?;

        tracing::info!(file = %checkpoint.name, peer = %checkpoint.peer_id, "Resuming download");
        self.open(&code, password).await?;
        self.resume = Some(checkpoint);
        Ok(())
    }

    async fn download(&mut self, file_id: &str, destination: Destination) -> Result<u64> {
        let Some(remote) = self.remote.clone().filter(|_| self.verified) else {
            return Err(Error::InvalidState("not connected".to_string()));
        };
        if self.waiters.download.is_some() {
            return Err(Error::InvalidState(
                "another download is running".to_string(),
            ));
        }

        let resume = match &destination {
            Destination::Disk(path) => match self.engine.store().load().await {
                Ok(Some(checkpoint))
                    if checkpoint.peer_id == remote
                        && checkpoint.file_id.as_deref() == Some(file_id)
                        && &checkpoint.handle == path =>
                {
                    Some(checkpoint)
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable resume checkpoint: {e}");
                    None
                }
            },
            Destination::Memory => None,
        };

        let offset = self
            .engine
            .begin(file_id, destination, resume.as_ref())
            .await?;
        self.request_file(Some(file_id.to_string()), offset).await?;
        Ok(offset)
    }

    async fn request_file(&mut self, file_id: Option<String>, offset_bytes: u64) -> Result<()> {
        let message = Message::RequestFile {
            file_id,
            offset_bytes,
        };
        if let Err(e) = self.send_control(message) {
            self.engine.abort(false).await;
            return Err(e);
        }
        Ok(())
    }

    fn on_schedule_elapsed(&mut self) {
        let Some((file_id, offset)) = self.engine.on_schedule_elapsed() else {
            return;
        };
        tracing::info!(file = %file_id, offset, "Schedule elapsed, requesting again");
        let message = Message::RequestFile {
            file_id: Some(file_id),
            offset_bytes: offset,
        };
        if let Err(e) = self.send_control(message) {
            tracing::warn!("Repeated request not sent: {e}");
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Data {
                channel,
                remote,
                frame,
            } => {
                if self.remote.as_ref() != Some(&remote) || self.pool.get(channel).is_none() {
                    return;
                }
                match frame {
                    Frame::Control(message) => self.on_message(channel, message).await,
                    Frame::Chunk { index, data } => {
                        let result = self.engine.on_chunk(index, &data).await;
                        self.settle_download(result);
                    }
                    Frame::Open(_) => {
                        tracing::debug!(channel, "Ignoring open frame");
                    }
                }
            }
            ChannelEvent::Error { channel, error } => {
                tracing::debug!(channel, "Channel error: {error}");
            }
            ChannelEvent::Closed { channel, .. } => {
                if self.pool.remove(channel).is_some() && self.pool.is_empty() {
                    self.on_connection_lost().await;
                }
            }
        }
    }

    async fn on_message(&mut self, channel: ChannelId, message: Message) {
        match message {
            Message::HandshakeOk => self.on_handshake_ok(channel).await,
            Message::AuthRequired => self.on_auth_required(channel),
            Message::AuthError => {
                tracing::warn!(channel, "Password rejected");
                self.auth.in_flight = None;
                self.auth.candidate = None;
                self.emit(ReceiveEvent::AuthFailed);
                if let Some(reply) = self.waiters.password.take() {
                    let _ = reply.send(Err(Error::AuthFailed));
                }
                if let Some(reply) = self.waiters.connect.take() {
                    let _ = reply.send(Err(Error::AuthFailed));
                }
                if self.resume.take().is_some() {
                    if let Some(reply) = self.waiters.download.take() {
                        let _ = reply.send(Err(Error::AuthFailed));
                    }
                }
            }
            Message::MetadataList { files } => {
                let Some(remote) = self.remote.clone() else {
                    return;
                };
                self.engine.on_catalog(files, &remote);
                let catalog = self.engine.catalog().to_vec();
                self.emit(ReceiveEvent::CatalogUpdated {
                    files: catalog.clone(),
                });
                if let Some(reply) = self.waiters.connect.take() {
                    let _ = reply.send(Ok(ConnectOutcome::Ready(catalog.clone())));
                }
                if let Some(reply) = self.waiters.password.take() {
                    let _ = reply.send(Ok(catalog));
                }
            }
            Message::ScheduleWait { seconds } => {
                self.engine.on_schedule_wait(seconds);
                if self.engine.state() == ReceiverState::Scheduled {
                    self.schedule_deadline = Some(Instant::now() + Duration::from_secs(seconds));
                    self.emit(ReceiveEvent::Scheduled { seconds });
                }
            }
            Message::FileStart(start) => {
                if let Err(e) = self.engine.on_file_start(start).await {
                    self.settle_download(Err(e));
                }
            }
            Message::FileEnd => {
                let result = self.engine.on_file_end().await;
                if matches!(result, Ok(None)) && self.engine.awaiting_stragglers() {
                    self.grace_deadline = Some(Instant::now() + self.config.finalize_grace);
                }
                self.settle_download(result);
            }
            Message::Rejected { reason } => {
                tracing::warn!(channel, %reason, "Sender rejected us");
                self.emit(ReceiveEvent::Rejected {
                    reason: reason.clone(),
                });
                if self.verified {
                    if self.engine.pending_request().is_some() {
                        self.engine.abort(false).await;
                    }
                    if let Some(reply) = self.waiters.download.take() {
                        let _ = reply.send(Err(Error::ConnectionRejected(reason)));
                    }
                } else {
                    self.pool.close(channel);
                    if let Some(reply) = self.waiters.connect.take() {
                        let _ = reply.send(Err(Error::ConnectionRejected(reason)));
                    }
                    if self.pool.is_empty() {
                        self.on_connection_lost().await;
                    }
                }
            }
            other => {
                tracing::debug!(channel, kind = other.kind(), "Ignoring message");
            }
        }
    }

    fn on_auth_required(&mut self, channel: ChannelId) {
        self.pool.set_state(channel, ChannelState::AwaitingAuth);
        self.engine.on_auth_required();

        if self.auth.accepted || self.auth.in_flight.is_none() {
            if let Some(password) = self.auth.candidate.clone() {
                if !self.auth.accepted {
                    self.auth.in_flight = Some(channel);
                }
                self.send_auth(channel, password);
                return;
            }
        }
        if self.auth.in_flight.is_some() {
            return;
        }

        if let Some(reply) = self.waiters.connect.take() {
            self.emit(ReceiveEvent::PasswordRequired);
            let _ = reply.send(Ok(ConnectOutcome::PasswordRequired));
        }
        if self.resume.take().is_some() {
            if let Some(reply) = self.waiters.download.take() {
                let _ = reply.send(Err(Error::AuthFailed));
            }
        }
    }

    async fn on_handshake_ok(&mut self, channel: ChannelId) {
        self.pool.set_state(channel, ChannelState::Verified);

        if self.auth.in_flight == Some(channel) {
            self.auth.in_flight = None;
            self.auth.accepted = true;
            if let Some(password) = self.auth.candidate.clone() {
                let waiting: Vec<ChannelId> = self.channels_in_state(ChannelState::AwaitingAuth);
                for id in waiting {
                    self.send_auth(id, password.clone());
                }
            }
        }

        let Some(remote) = self.remote.clone() else {
            return;
        };
        if self.verified || self.pool.verified_for(&remote).len() < self.pool.len() {
            return;
        }

        self.verified = true;
        self.engine.on_verified();
        tracing::info!(peer = %remote, "Channels verified");
        self.emit(ReceiveEvent::Verified);

        if let Some(checkpoint) = self.resume.take() {
            self.engine.restore(&checkpoint);
            let file_id = checkpoint.file_id.clone().unwrap_or_default();
            let started = self
                .engine
                .begin(
                    &file_id,
                    Destination::Disk(checkpoint.handle.clone()),
                    Some(&checkpoint),
                )
                .await;
            let result = match started {
                Ok(offset) => {
                    self.emit(ReceiveEvent::DownloadStarted {
                        file_id: file_id.clone(),
                        offset,
                    });
                    self.request_file(checkpoint.file_id.clone(), offset).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.settle_download(Err(e));
            }
        } else if let Err(e) = self.send_control(Message::GetMetadata) {
            tracing::warn!("get_metadata not sent: {e}");
        }
    }

    fn send_auth(&self, channel: ChannelId, password: String) {
        if let Err(e) = self
            .pool
            .send(channel, &Frame::Control(Message::Auth { password }))
        {
            tracing::debug!(channel, "Auth not sent: {e}");
        }
    }

    /// Resolve the download waiter from an engine result.
    fn settle_download(&mut self, result: Result<Option<CompletedFile>>) {
        match result {
            Ok(None) => {}
            Ok(Some(file)) => {
                self.grace_deadline = None;
                self.emit(ReceiveEvent::DownloadFinished { file: file.clone() });
                if let Some(reply) = self.waiters.download.take() {
                    let _ = reply.send(Ok(file));
                }
            }
            Err(e) => {
                self.grace_deadline = None;
                tracing::warn!("Download failed: {e}");
                self.emit(ReceiveEvent::DownloadFailed {
                    error: e.to_string(),
                });
                if let Some(reply) = self.waiters.download.take() {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn on_connection_lost(&mut self) {
        let Some(remote) = self.remote.take() else {
            return;
        };
        tracing::warn!(peer = %remote, "Connection lost");
        self.verified = false;
        self.auth = AuthState::default();
        self.resume = None;
        self.schedule_deadline = None;
        self.grace_deadline = None;
        self.engine.suspend().await;

        let lost = remote.to_string();
        self.waiters
            .fail_all(|| Error::ConnectionLost(lost.clone()));
        self.emit(ReceiveEvent::Disconnected);
    }

    /// Close every channel and forget the sender. The active download, if
    /// any, is suspended with its checkpoint kept.
    async fn disconnect(&mut self) {
        self.pool.close_all();
        if self.remote.take().is_some() {
            self.engine.suspend().await;
        }
        self.verified = false;
        self.auth = AuthState::default();
        self.resume = None;
        self.schedule_deadline = None;
        self.grace_deadline = None;
    }

    fn send_control(&self, message: Message) -> Result<()> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::InvalidState("not connected".to_string()))?;
        let channel = self
            .pool
            .any_verified(remote)
            .ok_or_else(|| Error::ConnectionLost(remote.to_string()))?;
        channel.send(&Frame::Control(message))
    }

    fn channels_in_state(&self, state: ChannelState) -> Vec<ChannelId> {
        self.remote
            .as_ref()
            .map(|remote| self.pool.ids_in_state(remote, state))
            .unwrap_or_default()
    }

    fn emit(&self, event: ReceiveEvent) {
        let _ = self.events.send(event);
    }
}

/// Handle to a running [`ReceiveSession`].
#[derive(Debug, Clone)]
pub struct ReceiveHandle {
    commands: mpsc::Sender<ReceiveCommand>,
    events: broadcast::Sender<ReceiveEvent>,
    progress: watch::Receiver<TransferProgress>,
}

impl ReceiveHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ReceiveCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        recv_reply(rx).await
    }

    /// Connect to `code`, verify every channel and fetch the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerUnavailable`] if nothing answers under the code,
    /// [`Error::HumanCheckRequired`] while a challenge is pending, or
    /// [`Error::ConnectionRejected`] if the sender refused us.
    pub async fn connect(&self, code: &ShareCode) -> Result<ConnectOutcome> {
        let code = code.clone();
        self.request(|reply| ReceiveCommand::Connect {
            code,
            password: None,
            reply,
        })
        .await?
    }

    /// Connect and answer a password request with `password` right away.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), plus [`Error::AuthFailed`] for a
    /// wrong password.
    pub async fn connect_with_password(
        &self,
        code: &ShareCode,
        password: &str,
    ) -> Result<ConnectOutcome> {
        let code = code.clone();
        let password = Some(password.to_string());
        self.request(|reply| ReceiveCommand::Connect {
            code,
            password,
            reply,
        })
        .await?
    }

    /// Answer the sender's password request. Returns the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailed`] for a wrong password; the connection
    /// stays open and another attempt may follow.
    pub async fn submit_password(&self, password: &str) -> Result<Vec<IncomingFile>> {
        let password = password.to_string();
        self.request(|reply| ReceiveCommand::SubmitPassword { password, reply })
            .await?
    }

    /// Continue an interrupted download. Uses the stored checkpoint when
    /// `checkpoint` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if there is nothing to resume, or any
    /// connect or download error.
    pub async fn resume(
        &self,
        checkpoint: Option<ResumeCheckpoint>,
        password: Option<String>,
    ) -> Result<CompletedFile> {
        self.request(|reply| ReceiveCommand::Resume {
            checkpoint,
            password,
            reply,
        })
        .await?
    }

    /// Download one catalog file and wait for it to finish.
    ///
    /// A stored checkpoint for the same sender, file and path is picked up
    /// automatically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferIncomplete`] if the stream ended short,
    /// [`Error::ConnectionLost`] if the sender went away, or the write error.
    pub async fn download(&self, file_id: &str, destination: Destination) -> Result<CompletedFile> {
        let file_id = file_id.to_string();
        self.request(|reply| ReceiveCommand::Download {
            file_id,
            destination,
            reply,
        })
        .await?
    }

    /// Download every catalog file into `dir`, one after another.
    ///
    /// # Errors
    ///
    /// Stops at the first failed file and returns its error.
    pub async fn download_all(&self, dir: PathBuf) -> Result<Vec<CompletedFile>> {
        let catalog = self.catalog().await?;
        let mut done = Vec::with_capacity(catalog.len());
        for entry in catalog {
            let destination = Destination::Disk(dir.join(entry.relative_path()));
            done.push(self.download(&entry.id, destination).await?);
        }
        Ok(done)
    }

    /// Current catalog.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn catalog(&self) -> Result<Vec<IncomingFile>> {
        self.request(|reply| ReceiveCommand::Catalog { reply }).await
    }

    /// Current receiver state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn state(&self) -> Result<ReceiverState> {
        self.request(|reply| ReceiveCommand::State { reply }).await
    }

    /// The pending human-check question, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn human_challenge(&self) -> Result<Option<String>> {
        self.request(|reply| ReceiveCommand::HumanChallenge { reply })
            .await
    }

    /// Answer the human check. Returns whether connecting is allowed again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn solve_human_check(&self, answer: &str) -> Result<bool> {
        let answer = answer.to_string();
        self.request(|reply| ReceiveCommand::SolveHumanCheck { answer, reply })
            .await
    }

    /// Watch download progress.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiveEvent> {
        self.events.subscribe()
    }

    /// Disconnect and clear the catalog and the resume checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| ReceiveCommand::Reset { reply }).await
    }

    /// Stop the session. Partial downloads keep their checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ReceiveCommand::Shutdown { reply }).await
    }
}
