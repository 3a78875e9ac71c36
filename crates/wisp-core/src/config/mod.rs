//! Configuration management for Wisp.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/wisp/config.toml` |
//! | macOS | `~/Library/Application Support/com.wisp.Wisp/config.toml` |
//! | Windows | `%APPDATA%\wisp\Wisp\config\config.toml` |
//!
//! A missing file means defaults. Durations are written as `"30s"` or `"5m"`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wisp_core::config::Config;
//!
//! let config = Config::load()?;
//! let session = config.session_config();
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::security::PasswordGate;
use crate::session::SessionConfig;
use crate::transfer::TransferTuning;

/// Main configuration struct for Wisp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Security settings
    pub security: SecurityConfig,
}

/// General configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name announced to nearby peers
    pub device_name: String,
    /// Default output directory for received files
    pub default_output: Option<PathBuf>,
    /// Base URL for share links
    pub origin: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Wisp Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            default_output: None,
            origin: "https://wisp.local".to_string(),
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for the TCP transport
    pub listen: SocketAddr,
    /// Registry URL used to publish and resolve endpoints
    pub registry: Option<String>,
    /// Deadline for a channel pool to open
    #[serde(with = "duration_str")]
    pub open_timeout: Duration,
    /// How often a live endpoint is re-announced
    #[serde(with = "duration_str")]
    pub announce_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 0)),
            registry: None,
            open_timeout: crate::CHANNEL_OPEN_TIMEOUT,
            announce_interval: Duration::from_secs(10),
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Channels opened per peer
    pub parallel_channels: usize,
    /// Inbound channels tolerated above `parallel_channels`
    pub channel_slack: usize,
    /// Per-channel buffered bytes above which sending pauses
    pub max_buffered_amount: usize,
    /// Progress is recomputed every this many chunks
    pub progress_interval: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            parallel_channels: crate::DEFAULT_PARALLEL_CHANNELS,
            channel_slack: crate::CHANNEL_SLACK,
            max_buffered_amount: crate::MAX_BUFFERED_AMOUNT,
            progress_interval: crate::PROGRESS_INTERVAL_CHUNKS,
        }
    }
}

/// Security configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Generate a password for every sharing session
    pub require_password: bool,
    /// Failures within `failure_window` that rotate the identity
    pub failure_threshold: usize,
    /// Sliding window for failures
    #[serde(with = "duration_str")]
    pub failure_window: Duration,
    /// Unreachable connects before a human check
    pub human_check_threshold: u32,
    /// Lock the room once a transfer starts
    pub lock_on_transfer: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_password: false,
            failure_threshold: crate::SECURITY_THRESHOLD,
            failure_window: crate::SECURITY_WINDOW,
            human_check_threshold: crate::HUMAN_CHECK_THRESHOLD,
            lock_on_transfer: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, defaulting when it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "wisp", "Wisp")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Reject values the sessions cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| {
            Err(Error::InvalidConfig {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.transfer.chunk_size == 0 {
            return invalid("transfer.chunk_size", "must be greater than zero");
        }
        if self.transfer.chunk_size > crate::protocol::MAX_PAYLOAD_SIZE - 8 {
            return invalid("transfer.chunk_size", "does not fit in one frame");
        }
        if self.transfer.parallel_channels == 0 {
            return invalid("transfer.parallel_channels", "must be greater than zero");
        }
        if self.security.failure_threshold == 0 {
            return invalid("security.failure_threshold", "must be greater than zero");
        }
        if self.security.human_check_threshold == 0 {
            return invalid("security.human_check_threshold", "must be greater than zero");
        }
        if self.network.open_timeout.is_zero() {
            return invalid("network.open_timeout", "must be greater than zero");
        }
        Ok(())
    }

    /// Runtime settings for a session. Sharing sessions get a fresh
    /// password when `security.require_password` is set.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            tuning: TransferTuning {
                chunk_size: self.transfer.chunk_size,
                max_buffered: self.transfer.max_buffered_amount,
                progress_interval: self.transfer.progress_interval,
            },
            parallel_channels: self.transfer.parallel_channels,
            channel_slack: self.transfer.channel_slack,
            open_timeout: self.network.open_timeout,
            failure_threshold: self.security.failure_threshold,
            failure_window: self.security.failure_window,
            human_check_threshold: self.security.human_check_threshold,
            password: if self.security.require_password {
                PasswordGate::generated()
            } else {
                PasswordGate::open()
            },
            lock_on_transfer: self.security.lock_on_transfer,
            origin: self.general.origin.clone(),
            ..SessionConfig::default()
        }
    }
}

/// `"30s"` / `"5m"` durations.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        if secs > 0 && secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{secs}s"))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        s.strip_suffix('s')
            .map(|secs| {
                secs.trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.trim()
                        .parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
