//! Raw segment files
//!
//! A minimal container that needs no encoder: a fixed header followed by
//! length-prefixed RGB frames. The header is written as a placeholder when the
//! segment opens and rewritten with the final values on close.
//!
//! ```text
//! header (32 bytes, little endian)
//!   magic "KSEG" | start_us i64 | end_us i64 | frame_count u32 | width u32 | height u32
//! frame record
//!   len u32 | captured_us i64 | len bytes of RGB8
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::backend::{SegmentSpec, SegmentWriter, SegmentWriterBackend};
use crate::frame::{Frame, Resolution};

const MAGIC: &[u8; 4] = b"KSEG";
pub const HEADER_LEN: u64 = 32;

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub start_us: i64,
    pub end_us: i64,
    pub frame_count: u32,
    pub resolution: Resolution,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..12].copy_from_slice(&self.start_us.to_le_bytes());
        buf[12..20].copy_from_slice(&self.end_us.to_le_bytes());
        buf[20..24].copy_from_slice(&self.frame_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.resolution.width.to_le_bytes());
        buf[28..32].copy_from_slice(&self.resolution.height.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self> {
        ensure!(&buf[0..4] == MAGIC, "Not a segment file (bad magic)");
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let i64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            i64::from_le_bytes(b)
        };
        Ok(Self {
            start_us: i64_at(4),
            end_us: i64_at(12),
            frame_count: u32_at(20),
            resolution: Resolution::new(u32_at(24), u32_at(28)),
        })
    }
}

/// Read the header of a closed segment
pub async fn read_header(path: &Path) -> Result<SegmentHeader> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open segment {:?}", path))?;
    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buf)
        .await
        .with_context(|| format!("Segment {:?} is truncated", path))?;
    SegmentHeader::decode(&buf)
}

/// Segment backend writing raw `.kseg` files
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSegmentBackend;

impl RawSegmentBackend {
    pub const EXTENSION: &'static str = "kseg";
}

#[async_trait::async_trait]
impl SegmentWriterBackend for RawSegmentBackend {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    async fn open_segment(
        &self,
        path: &Path,
        spec: &SegmentSpec,
    ) -> Result<Box<dyn SegmentWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to create segment {:?}", path))?;
        let mut file = BufWriter::new(file);

        // Write placeholder header
        file.write_all(&[0u8; HEADER_LEN as usize]).await?;

        debug!(path = %path.display(), resolution = %spec.resolution, "Segment opened");
        Ok(Box::new(RawSegmentWriter {
            file: Some(file),
            path: path.to_path_buf(),
            resolution: spec.resolution,
            start_us: None,
            end_us: 0,
            frame_count: 0,
            bytes_written: HEADER_LEN,
        }))
    }
}

struct RawSegmentWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    resolution: Resolution,
    start_us: Option<i64>,
    end_us: i64,
    frame_count: u32,
    bytes_written: u64,
}

#[async_trait::async_trait]
impl SegmentWriter for RawSegmentWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            bail!("Segment {:?} is already closed", self.path);
        };
        ensure!(
            frame.resolution == self.resolution,
            "Frame is {} but segment is {}",
            frame.resolution,
            self.resolution
        );
        let len = u32::try_from(frame.data.len()).context("Frame too large for segment")?;
        let captured_us = frame.captured_at.timestamp_micros();

        file.write_all(&len.to_le_bytes()).await?;
        file.write_all(&captured_us.to_le_bytes()).await?;
        file.write_all(&frame.data).await?;

        self.start_us.get_or_insert(captured_us);
        self.end_us = captured_us;
        self.frame_count += 1;
        self.bytes_written += 12 + u64::from(len);
        Ok(())
    }

    async fn close(&mut self) -> Result<u64> {
        let Some(mut writer) = self.file.take() else {
            return Ok(self.bytes_written);
        };
        writer.flush().await?;
        let mut file = writer.into_inner();

        let header = SegmentHeader {
            start_us: self.start_us.unwrap_or_default(),
            end_us: self.end_us,
            frame_count: self.frame_count,
            resolution: self.resolution,
        };
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&header.encode()).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(
            path = %self.path.display(),
            frames = self.frame_count,
            bytes = self.bytes_written,
            "Segment finalized"
        );
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{TimeDelta, Utc};

    fn spec(resolution: Resolution) -> SegmentSpec {
        SegmentSpec {
            fps: 10,
            resolution,
            codec: "raw".into(),
            bitrate: 0,
        }
    }

    fn frame(resolution: Resolution) -> Frame {
        Frame::rgb(resolution, Bytes::from(vec![3u8; resolution.rgb_len()])).unwrap()
    }

    #[tokio::test]
    async fn close_rewrites_header_and_reports_disk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.kseg");
        let res = Resolution::new(4, 2);
        let t0 = Utc::now();

        let mut writer = RawSegmentBackend
            .open_segment(&path, &spec(res))
            .await
            .unwrap();
        for i in 0..3 {
            let f = frame(res).with_captured_at(t0 + TimeDelta::milliseconds(100 * i));
            writer.write_frame(&f).await.unwrap();
        }
        let size = writer.close().await.unwrap();

        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        assert_eq!(size, HEADER_LEN + 3 * (12 + 24));

        let header = read_header(&path).await.unwrap();
        assert_eq!(header.frame_count, 3);
        assert_eq!(header.resolution, res);
        assert_eq!(header.start_us, t0.timestamp_micros());
        assert_eq!(header.end_us - header.start_us, 200_000);
    }

    #[tokio::test]
    async fn rejects_mismatched_frames_and_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.kseg");
        let mut writer = RawSegmentBackend
            .open_segment(&path, &spec(Resolution::new(4, 2)))
            .await
            .unwrap();
        assert!(writer.write_frame(&frame(Resolution::new(2, 2))).await.is_err());
        writer.close().await.unwrap();
        assert!(writer.write_frame(&frame(Resolution::new(4, 2))).await.is_err());
        // Closing twice is harmless
        assert_eq!(writer.close().await.unwrap(), HEADER_LEN);
    }

    #[tokio::test]
    async fn read_header_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other");
        std::fs::write(&path, vec![1u8; 64]).unwrap();
        assert!(read_header(&path).await.is_err());
    }
}
