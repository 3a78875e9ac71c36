//! Resume checkpoint persistence.
//!
//! At most one resumable download exists at a time. Its checkpoint is a
//! single JSON record stored under a fixed sentinel name in the
//! platform-specific data directory:
//! - Linux: `~/.local/share/wisp/resume/`
//! - macOS: `~/Library/Application Support/Wisp/resume/`
//! - Windows: `%APPDATA%\Wisp\resume\`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::code::EndpointId;
use crate::error::{Error, Result};

/// Sentinel key of the one checkpoint record.
pub const CHECKPOINT_ID: &str = "current_transfer";

/// Persisted state of an in-flight download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Always [`CHECKPOINT_ID`]
    pub id: String,
    /// File name
    pub name: String,
    /// Declared file size
    pub size: u64,
    /// Sender endpoint the file came from
    pub peer_id: EndpointId,
    /// Output file being written
    pub handle: PathBuf,
    /// Sender-assigned file id
    #[serde(default)]
    pub file_id: Option<String>,
    /// Bytes known to be written contiguously from offset 0
    #[serde(default)]
    pub committed_bytes: u64,
    /// When the download began
    pub started_at: DateTime<Utc>,
}

impl ResumeCheckpoint {
    /// Checkpoint for a download that is just starting.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        peer_id: EndpointId,
        handle: PathBuf,
        file_id: Option<String>,
    ) -> Self {
        Self {
            id: CHECKPOINT_ID.to_string(),
            name: name.into(),
            size,
            peer_id,
            handle,
            file_id,
            committed_bytes: 0,
            started_at: Utc::now(),
        }
    }
}

/// Reads and writes the checkpoint record.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// Store in the default platform directory.
    pub fn new() -> Self {
        Self::with_dir(Self::default_dir())
    }

    /// Store in a custom directory. The directory is created on first save.
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn default_dir() -> PathBuf {
        directories::ProjectDirs::from("com", "wisp", "Wisp")
            .map_or_else(|| PathBuf::from(".wisp"), |dirs| dirs.data_dir().to_path_buf())
            .join("resume")
    }

    /// Directory holding the record.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{CHECKPOINT_ID}.json"))
    }

    /// Write the checkpoint, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.record_path();
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| Error::Serialization(format!("resume checkpoint: {e}")))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        tracing::debug!(
            file = %checkpoint.name,
            committed = checkpoint.committed_bytes,
            "Saved resume checkpoint"
        );
        Ok(())
    }

    /// Read the checkpoint, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<Option<ResumeCheckpoint>> {
        let path = self.record_path();
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: ResumeCheckpoint = serde_json::from_slice(&data)
            .map_err(|e| Error::ResumeMismatch(format!("unreadable checkpoint: {e}")))?;
        if checkpoint.id != CHECKPOINT_ID {
            return Err(Error::ResumeMismatch(format!(
                "unexpected checkpoint id {}",
                checkpoint.id
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Delete the checkpoint. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(self.record_path()).await {
            Ok(()) => {
                tracing::debug!("Cleared resume checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for ResumeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::with_dir(dir.path().join("resume"));
        assert!(store.load().await.expect("load").is_none());

        let mut checkpoint = ResumeCheckpoint::new(
            "movie.mkv",
            10 * 1024 * 1024,
            EndpointId::from_raw("wisp-transfer-v2-123456"),
            dir.path().join("movie.mkv"),
            Some("f1".to_string()),
        );
        checkpoint.committed_bytes = 50 * 65536;
        store.save(&checkpoint).await.expect("save");

        let loaded = store.load().await.expect("load").expect("checkpoint");
        assert_eq!(loaded, checkpoint);

        store.clear().await.expect("clear");
        assert!(store.load().await.expect("load").is_none());
        store.clear().await.expect("clear twice");
    }

    #[tokio::test]
    async fn test_save_replaces_previous_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::with_dir(dir.path().to_path_buf());
        let peer = EndpointId::from_raw("peer");

        store
            .save(&ResumeCheckpoint::new("a", 1, peer.clone(), "a".into(), None))
            .await
            .expect("save");
        store
            .save(&ResumeCheckpoint::new("b", 2, peer, "b".into(), None))
            .await
            .expect("save");

        let loaded = store.load().await.expect("load").expect("checkpoint");
        assert_eq!(loaded.name, "b");
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::with_dir(dir.path().to_path_buf());
        std::fs::write(dir.path().join("current_transfer.json"), b"{not json").expect("write");

        assert!(matches!(
            store.load().await,
            Err(Error::ResumeMismatch(_))
        ));
    }
}
