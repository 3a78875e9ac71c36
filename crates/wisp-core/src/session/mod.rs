//! Share and receive sessions.
//!
//! Each session is an actor: one task owns the endpoint, the channel pool
//! and the engine state, and reacts to channel events, transport events and
//! commands one at a time. Callers talk to it through a cloneable handle
//! (commands over `mpsc`, replies over `oneshot`), subscribe to a
//! `broadcast` of events, and watch progress through a `watch` channel.
//!
//! - [`ShareSession`]: hosts files under one share code
//! - [`ReceiveSession`]: connects to a share code and downloads files

mod receive;
mod share;

pub use receive::{ConnectOutcome, ReceiveEvent, ReceiveHandle, ReceiveSession};
pub use share::{HostedFile, ShareEvent, ShareHandle, ShareSession, ShareSnapshot};

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::security::PasswordGate;
use crate::transfer::{ResumeStore, TransferTuning};

/// How long the receiver waits for stragglers after `file_end`.
pub const FINALIZE_GRACE: Duration = Duration::from_secs(3);

/// Depth of every session's command and channel-event queues.
const QUEUE_DEPTH: usize = 256;

/// Capacity of event broadcasts.
const EVENT_CAPACITY: usize = 64;

/// Runtime settings for both session roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunking and backpressure
    pub tuning: TransferTuning,
    /// Channels opened per peer
    pub parallel_channels: usize,
    /// Inbound channels tolerated above `parallel_channels`
    pub channel_slack: usize,
    /// Deadline for a channel pool to open
    pub open_timeout: Duration,
    /// Failures within `failure_window` that rotate the identity
    pub failure_threshold: usize,
    /// Sliding window for failures
    pub failure_window: Duration,
    /// Unreachable connects before a human check
    pub human_check_threshold: u32,
    /// Password gate of a sharing session
    pub password: PasswordGate,
    /// Lock the room as soon as a transfer starts
    pub lock_on_transfer: bool,
    /// Base URL for share links
    pub origin: String,
    /// Directory of the resume checkpoint; platform default when `None`
    pub resume_dir: Option<PathBuf>,
    /// Grace period for chunks arriving after `file_end`
    pub finalize_grace: Duration,
}

impl SessionConfig {
    pub(crate) fn resume_store(&self) -> ResumeStore {
        self.resume_dir
            .clone()
            .map_or_else(ResumeStore::new, ResumeStore::with_dir)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tuning: TransferTuning::default(),
            parallel_channels: crate::DEFAULT_PARALLEL_CHANNELS,
            channel_slack: crate::CHANNEL_SLACK,
            open_timeout: crate::CHANNEL_OPEN_TIMEOUT,
            failure_threshold: crate::SECURITY_THRESHOLD,
            failure_window: crate::SECURITY_WINDOW,
            human_check_threshold: crate::HUMAN_CHECK_THRESHOLD,
            password: PasswordGate::open(),
            lock_on_transfer: false,
            origin: "https://wisp.local".to_string(),
            resume_dir: None,
            finalize_grace: FINALIZE_GRACE,
        }
    }
}

/// Wait for a reply from the session actor.
async fn recv_reply<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await.map_err(|_| Error::SessionClosed)
}

/// Sleep until `at`, or forever when unset.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
