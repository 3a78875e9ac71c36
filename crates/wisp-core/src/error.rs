//! Error types for Wisp.
//!
//! This module provides a unified error type for all Wisp operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Wisp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Wisp.
#[derive(Error, Debug)]
pub enum Error {
    /// No channel to the peer opened before the deadline (E001)
    #[error("address not found: peer '{0}' could not be reached")]
    PeerUnavailable(String),

    /// Only part of the channel pool opened before the deadline (E002)
    #[error("only {opened} of {requested} channels opened")]
    ChannelPoolIncomplete {
        /// Channels that reported open
        opened: usize,
        /// Channels requested
        requested: usize,
    },

    /// Every identity candidate collided (E003)
    #[error("could not generate unique identity after {0} attempts")]
    IdentityExhausted(u32),

    /// The endpoint id is already registered by someone else
    #[error("endpoint id '{0}' is already taken")]
    EndpointTaken(String),

    /// Invalid code format
    #[error("invalid code format: {0}")]
    InvalidCodeFormat(String),

    /// Invalid protocol message or frame
    #[error("protocol violation: {0}")]
    ProtocolError(String),

    /// Chunk payload above the accepted bound
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Accepted maximum
        limit: usize,
    },

    /// Password rejected by the sender (E004)
    #[error("authentication failed: wrong password")]
    AuthFailed,

    /// Sender refused the connection (E005)
    #[error("connection rejected by sender: {0}")]
    ConnectionRejected(String),

    /// Too many unreachable attempts, a challenge must be solved first (E006)
    #[error("human check required before connecting again")]
    HumanCheckRequired,

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// File id not present in the catalog
    #[error("unknown file id: {0}")]
    UnknownFile(String),

    /// Writing received data to the destination failed (E007)
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Resume checkpoint does not match the destination
    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),

    /// All channels to the peer closed during an operation (E008)
    #[error("connection lost to {0}")]
    ConnectionLost(String),

    /// Stream ended without every chunk being handed to a channel
    #[error("transfer incomplete: {dropped} chunks were dropped")]
    TransferIncomplete {
        /// Chunks that were never sent
        dropped: u64,
    },

    /// The discovery registry could not be reached or answered badly (E009)
    #[error("registry request failed: {0}")]
    Registry(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// The session actor has shut down
    #[error("session closed")]
    SessionClosed,

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::PeerUnavailable(_) => Some("E001"),
            Self::ChannelPoolIncomplete { .. } => Some("E002"),
            Self::IdentityExhausted(_) => Some("E003"),
            Self::AuthFailed => Some("E004"),
            Self::ConnectionRejected(_) => Some("E005"),
            Self::HumanCheckRequired => Some("E006"),
            Self::WriteFailed(_) => Some("E007"),
            Self::ConnectionLost(_) => Some("E008"),
            Self::Registry(_) => Some("E009"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable(_)
                | Self::ChannelPoolIncomplete { .. }
                | Self::AuthFailed
                | Self::HumanCheckRequired
                | Self::ConnectionLost(_)
                | Self::Registry(_)
                | Self::Timeout(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::PeerUnavailable(_) => {
                Some("Check the code and make sure the sender is still sharing.")
            }
            Self::IdentityExhausted(_) => Some("Restart wisp to mint a fresh identity."),
            Self::Registry(_) => Some("Check the --registry URL and that `wisp registry` is running."),
            Self::HumanCheckRequired => Some("Solve the arithmetic challenge, then try again."),
            Self::WriteFailed(_) => Some(
                "Check that the destination is writable and has free space.\n\
                 The download can be continued later with:\n\
                   wisp resume",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PeerUnavailable("x".into()).code(), Some("E001"));
        assert_eq!(Error::AuthFailed.code(), Some("E004"));
        assert_eq!(Error::SessionClosed.code(), None);
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::PeerUnavailable("x".into()).is_recoverable());
        assert!(Error::AuthFailed.is_recoverable());
        assert!(!Error::IdentityExhausted(5).is_recoverable());
        assert!(!Error::ProtocolError("bad".into()).is_recoverable());
    }

    #[test]
    fn test_unreachable_message_mentions_address() {
        let err = Error::PeerUnavailable("wisp-transfer-v2-123456".into());
        assert!(err.to_string().starts_with("address not found"));
        assert!(err.suggestion().is_some());
    }
}
