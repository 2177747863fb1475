//! Segment path layout
//!
//! `<root>/<camera id>/<YYYY-MM-DD>/<camera id>_<HH-MM-SS>.<ext>`, in UTC so
//! paths never collide or reorder across DST changes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::frame::CameraId;

/// Directory holding every segment of one camera
pub fn camera_dir(root: &Path, camera_id: &CameraId) -> PathBuf {
    root.join(camera_id.as_str())
}

/// Canonical path of a segment starting at `start`
pub fn segment_path(
    root: &Path,
    camera_id: &CameraId,
    start: DateTime<Utc>,
    extension: &str,
) -> PathBuf {
    camera_dir(root, camera_id)
        .join(start.format("%Y-%m-%d").to_string())
        .join(format!(
            "{}_{}.{}",
            camera_id,
            start.format("%H-%M-%S"),
            extension
        ))
}

/// Like [`segment_path`], but adds a `_N` suffix if the file already exists
/// (two segments of one camera starting within the same second).
pub async fn unique_segment_path(
    root: &Path,
    camera_id: &CameraId,
    start: DateTime<Utc>,
    extension: &str,
) -> PathBuf {
    let base = segment_path(root, camera_id, start, extension);
    if !exists(&base).await {
        return base;
    }
    let stem = format!("{}_{}", camera_id, start.format("%H-%M-%S"));
    let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{extension}"));
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn path_follows_layout() {
        let cam = CameraId::new("porch").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        let path = segment_path(Path::new("/srv/rec"), &cam, start, "kseg");
        assert_eq!(
            path,
            PathBuf::from("/srv/rec/porch/2024-03-09/porch_07-05-02.kseg")
        );
    }

    #[tokio::test]
    async fn unique_path_avoids_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cam = CameraId::new("yard").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = unique_segment_path(dir.path(), &cam, start, "kseg").await;
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"").unwrap();

        let second = unique_segment_path(dir.path(), &cam, start, "kseg").await;
        assert_ne!(first, second);
        assert!(second.ends_with("2024-01-01/yard_00-00-00_1.kseg"));
    }
}
