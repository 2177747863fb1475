//! Recording module: cuts a camera's frames into bounded segments and
//! registers each closed segment in the catalog.

pub mod segmenter;

pub use segmenter::{Segmenter, SegmenterConfig, SegmenterDeps, SegmenterHandle, SegmenterStatus};
