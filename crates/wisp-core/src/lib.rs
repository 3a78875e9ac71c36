//! # Wisp Core Library
//!
//! `wisp-core` moves files directly between two peers over a pool of
//! parallel channels, with resumable writes and a small verification
//! protocol in front of every channel.
//!
//! ## Features
//!
//! - **Short codes**: a 6-digit share code identifies one sending session
//! - **Parallel channels**: chunks are spread round-robin over several channels
//! - **Resume**: interrupted downloads continue from the bytes already on disk
//! - **Gating**: handshake verification, optional password, admission cap, room lock
//!
//! ## Modules
//!
//! - [`channel`] - Channel wrapper and the channel pool
//! - [`code`] - Share codes and endpoint identities
//! - [`config`] - Configuration management
//! - [`discovery`] - Peer discovery registry (nearby peers, endpoint lookup)
//! - [`mod@file`] - Chunk math, the background chunk reader and write sinks
//! - [`protocol`] - Wire frames and session messages
//! - [`qr`] - QR rendering of share URLs
//! - [`security`] - Failure window, password gate, admission, human check
//! - [`session`] - Share and receive session actors
//! - [`transfer`] - Sender and receiver engines, resume checkpoints
//! - [`transport`] - Raw stream transports (in-memory and TCP)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wisp_core::session::{ReceiveSession, SessionConfig, ShareSession};
//! use wisp_core::transport::MemoryTransport;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let share = ShareSession::start(transport.clone(), SessionConfig::default()).await?;
//! share.add_file("report.pdf".into(), None).await?;
//! let code = share.snapshot().await?.code;
//!
//! let receive = ReceiveSession::start(transport, SessionConfig::default());
//! receive.connect(&code).await?;
//! receive.download_all("downloads".into()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

use std::time::Duration;

pub mod channel;
pub mod code;
pub mod config;
pub mod discovery;
pub mod error;
pub mod file;
pub mod protocol;
pub mod qr;
pub mod security;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handshake token; peers must present exactly this value.
pub const PROTOCOL_VERSION: &str = "wisp-v1";

/// Namespace prefix shared by every endpoint identity.
pub const ENDPOINT_PREFIX: &str = "wisp-transfer-v2-";

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of parallel channels opened per peer
pub const DEFAULT_PARALLEL_CHANNELS: usize = 5;

/// Extra inbound channels tolerated above the parallelism factor
pub const CHANNEL_SLACK: usize = 2;

/// Per-channel buffered bytes above which the sender pauses (16 MiB)
pub const MAX_BUFFERED_AMOUNT: usize = 16 * 1024 * 1024;

/// Bytes a chunk payload may exceed the chunk size by
pub const CHUNK_PAYLOAD_SLACK: usize = 4096;

/// Progress is recomputed every this many chunks
pub const PROGRESS_INTERVAL_CHUNKS: u64 = 20;

/// The chunk reader yields after this many chunks
pub const READER_YIELD_EVERY: u64 = 100;

/// How long the chunk reader yields for
pub const READER_YIELD_PAUSE: Duration = Duration::from_millis(20);

/// Deadline for a channel pool to report fully open
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Qualifying failures within the window that trigger identity rotation
pub const SECURITY_THRESHOLD: usize = 5;

/// Sliding window for security failures
pub const SECURITY_WINDOW: Duration = Duration::from_secs(60);

/// Endpoint id collisions tolerated before giving up
pub const IDENTITY_RETRIES: u32 = 5;

/// Consecutive unreachable-peer results before a human check is required
pub const HUMAN_CHECK_THRESHOLD: u32 = 3;

/// Length of generated session passwords
pub const PASSWORD_LENGTH: usize = 8;
