//! Common test utilities for `Wisp` integration tests.
//!
//! Sessions run over the in-memory transport with small chunks so whole
//! transfers finish in milliseconds.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use wisp_core::session::{SessionConfig, ShareHandle, ShareSession};
use wisp_core::transfer::TransferTuning;
use wisp_core::transport::MemoryTransport;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1.len(), content2.len(), "File sizes differ");
    assert!(content1 == content2, "File contents differ");
}

/// Session settings for tests: given chunk size and channel count, and a
/// private resume directory.
pub fn test_config(chunk_size: usize, channels: usize, resume_dir: &Path) -> SessionConfig {
    SessionConfig {
        tuning: TransferTuning {
            chunk_size,
            ..TransferTuning::default()
        },
        parallel_channels: channels,
        resume_dir: Some(resume_dir.to_path_buf()),
        finalize_grace: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

/// Start a sharing session hosting `files`.
pub async fn start_share(
    transport: &MemoryTransport,
    config: SessionConfig,
    files: &[PathBuf],
) -> ShareHandle {
    let share = ShareSession::start(Arc::new(transport.clone()), config)
        .await
        .expect("Failed to start share session");
    for path in files {
        share
            .add_path(path.clone(), None)
            .await
            .expect("Failed to host file");
    }
    share
}

/// Await `fut`, failing the test after [`TEST_TIMEOUT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Timed out")
}

/// Wait for the first event matching `pick`.
pub async fn next_event<E, T>(
    events: &mut broadcast::Receiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T
where
    E: Clone,
{
    within(async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("Event stream closed"),
            }
        }
    })
    .await
}
