//! Storage module: where segments live on disk
//!
//! - [`layout`]: deterministic segment paths under the storage root
//! - [`segment_file`]: built-in raw segment writer
//! - usage scanning and idempotent deletes used by retention

pub mod layout;
pub mod segment_file;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

pub use layout::{camera_dir, segment_path, unique_segment_path};
pub use segment_file::{read_header, RawSegmentBackend, SegmentHeader};

/// Bytes and files under a directory tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub file_count: u64,
}

fn scan_usage_sync(root: &Path) -> StorageUsage {
    let mut usage = StorageUsage::default();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        // A file may disappear between listing and stat
        if let Ok(meta) = entry.metadata() {
            usage.total_bytes += meta.len();
            usage.file_count += 1;
        }
    }
    usage
}

/// Total size of every regular file under `root` (0 if it does not exist)
pub async fn scan_usage(root: impl Into<PathBuf>) -> Result<StorageUsage> {
    let root = root.into();
    let usage = tokio::task::spawn_blocking(move || scan_usage_sync(&root))
        .await
        .context("Storage scan task failed")?;
    Ok(usage)
}

/// Delete a file. A file that is already gone counts as deleted.
///
/// Returns whether the file existed.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create `dir` and its parents
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create storage directory: {:?}", dir))
}
