//! File operations for Wisp.
//!
//! This module handles:
//! - Chunk math (counts, byte ranges, resume indices)
//! - The background [`ChunkReader`] feeding the sender
//! - The [`FileSink`] write target of the receiver
//! - File name sanitization, MIME detection and size formatting

mod reader;
mod sink;

pub use reader::{ChunkReader, ReaderEvent, ReaderRequest};
pub use sink::{Destination, FileSink};

use std::ops::Range;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Longest file name kept after sanitization, in characters.
pub const MAX_FILE_NAME_LEN: usize = 200;

/// Number of chunks covering a file of `size` bytes.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Byte range of chunk `index` in a file of `size` bytes.
///
/// The last chunk may be shorter than `chunk_size`.
#[must_use]
pub fn chunk_range(index: u64, size: u64, chunk_size: usize) -> Range<u64> {
    let start = index.saturating_mul(chunk_size as u64).min(size);
    let end = start.saturating_add(chunk_size as u64).min(size);
    start..end
}

/// First chunk index to send for a stream resuming at `offset` bytes.
#[must_use]
pub const fn start_index(offset: u64, chunk_size: usize) -> u64 {
    offset / chunk_size as u64
}

/// Round `offset` down to a chunk boundary.
#[must_use]
pub const fn align_to_chunk(offset: u64, chunk_size: usize) -> u64 {
    start_index(offset, chunk_size) * chunk_size as u64
}

/// Make a peer-supplied file name safe to use as a local file name.
///
/// ASCII characters other than letters, digits, `.`, `-`, `_`, space and
/// parentheses become `_`. Non-ASCII characters are kept. The result is cut
/// to [`MAX_FILE_NAME_LEN`] characters, and names that would resolve to a
/// directory (`""`, `"."`, `".."`) become `"file"`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric()
                || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')')
                || !c.is_ascii()
            {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();

    match cleaned.trim() {
        "" | "." | ".." => "file".to_string(),
        _ => cleaned,
    }
}

/// Sanitize a `/`-separated relative path offered by a remote.
///
/// Each component goes through [`sanitize_file_name`]. Empty, `.` and `..`
/// components are dropped, so the result never leaves the directory it is
/// joined to. A backslash separates components too.
#[must_use]
pub fn sanitize_relative_path(name: &str) -> String {
    let parts: Vec<String> = name
        .split(['/', '\\'])
        .filter(|part| !matches!(part.trim(), "" | "." | ".."))
        .map(sanitize_file_name)
        .collect();

    if parts.is_empty() {
        "file".to_string()
    } else {
        parts.join("/")
    }
}

/// Turn a sanitized relative name into a path below some directory.
#[must_use]
pub fn relative_path(name: &str) -> PathBuf {
    name.split('/').collect()
}

/// MIME type guessed from the file extension.
#[must_use]
pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// A regular file found by [`enumerate_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Location on disk
    pub path: PathBuf,
    /// Name offered to peers: the base name for a plain file, the
    /// `/`-separated path below the walked directory otherwise
    pub name: String,
}

/// Expand paths into the regular files they contain.
///
/// Files are returned as given; directories are walked recursively and keep
/// their layout in [`SharedFile::name`]. Hidden entries below a directory
/// are skipped.
///
/// # Errors
///
/// Returns an error if a path does not exist or a directory cannot be walked.
pub fn enumerate_files(paths: &[PathBuf]) -> Result<Vec<SharedFile>> {
    let mut files = Vec::new();

    for path in paths {
        if !path.exists() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        if path.is_file() {
            files.push(SharedFile {
                path: path.clone(),
                name: base_name(path),
            });
            continue;
        }

        for entry in WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
        {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            if entry.file_type().is_file() {
                let name = entry
                    .path()
                    .strip_prefix(path)
                    .map_or_else(|_| base_name(entry.path()), relative_name);
                files.push(SharedFile {
                    path: entry.into_path(),
                    name,
                });
            }
        }
    }

    Ok(files)
}

/// Final component of `path`, or `"file"` when it has none.
#[must_use]
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned())
}

fn relative_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

/// Format a byte size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format a transfer rate for display.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{:.1} MB/s", bytes_per_sec / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: usize = 64 * 1024;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, C), 0);
        assert_eq!(chunk_count(1, C), 1);
        assert_eq!(chunk_count(C as u64, C), 1);
        assert_eq!(chunk_count(C as u64 + 1, C), 2);
        assert_eq!(chunk_count(10 * 1024 * 1024, C), 160);
    }

    #[test]
    fn test_chunk_ranges_tile_the_file() {
        for size in [0u64, 1, 4095, C as u64, C as u64 * 3, C as u64 * 3 + 17, 1_000_003] {
            let total = chunk_count(size, C);
            let mut cursor = 0;
            for index in 0..total {
                let range = chunk_range(index, size, C);
                assert_eq!(range.start, cursor, "gap or overlap at chunk {index}");
                assert!(range.end > range.start, "empty chunk {index}");
                assert!(range.end - range.start <= C as u64);
                cursor = range.end;
            }
            assert_eq!(cursor, size);
        }
    }

    #[test]
    fn test_start_index_and_alignment() {
        assert_eq!(start_index(0, C), 0);
        assert_eq!(start_index(50 * C as u64, C), 50);
        assert_eq!(start_index(50 * C as u64 + 100, C), 50);
        assert_eq!(align_to_chunk(50 * C as u64 + 100, C), 50 * C as u64);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report (final).pdf"), "report (final).pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("a<b>c:d?.txt"), "a_b_c_d_.txt");
        assert_eq!(sanitize_file_name("résumé.pdf"), "résumé.pdf");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(&"x".repeat(300)).chars().count(), MAX_FILE_NAME_LEN);
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(sanitize_relative_path("x/pic.jpg"), "x/pic.jpg");
        assert_eq!(sanitize_relative_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_relative_path("/abs//a?.txt"), "abs/a_.txt");
        assert_eq!(sanitize_relative_path("dir\\..\\b.txt"), "dir/b.txt");
        assert_eq!(sanitize_relative_path("../.."), "file");
        assert_eq!(sanitize_relative_path(""), "file");

        let dest = Path::new("/downloads");
        let joined = dest.join(relative_path(&sanitize_relative_path("../../x/../y.txt")));
        assert!(joined.starts_with(dest));
        assert_eq!(joined, Path::new("/downloads/x/y.txt"));
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type(Path::new("a.png")), "image/png");
        assert_eq!(mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_enumerate_files_walks_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("a.txt"), b"a").expect("write");
        std::fs::write(dir.path().join("sub/b.txt"), b"b").expect("write");
        std::fs::write(dir.path().join(".hidden"), b"h").expect("write");

        let files = enumerate_files(&[dir.path().to_path_buf()]).expect("enumerate");
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
        assert!(files.iter().all(|f| !f.path.ends_with(".hidden")));

        let single = enumerate_files(&[dir.path().join("sub/b.txt")]).expect("enumerate");
        assert_eq!(single[0].name, "b.txt");

        assert!(enumerate_files(&[dir.path().join("missing")]).is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0 MB");
    }
}
