//! Dataset interface for RGB-D sequences
//!
//! A dataset yields one [`RgbdFrame`] per index. Loading errors are per
//! frame: the frame loop skips a frame that fails to load and moves on.

use std::io;

use crate::core::{Camera, RgbdFrame};

/// Errors that can occur when loading datasets
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid dataset format: {0}")]
    Format(String),

    #[error("Image loading error: {0}")]
    Image(String),

    #[error("Manifest parse error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Frame index out of bounds: {0}")]
    FrameIndex(usize),

    #[error("Frame {0} has no depth")]
    MissingDepth(usize),
}

/// Result type for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Trait for RGB-D datasets
pub trait Dataset {
    /// Get the number of frames in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intrinsics of the tracking-resolution view
    fn camera(&self) -> Camera;

    /// Load frame `index`; `RgbdFrame::index` equals `index`
    fn load_frame(&self, index: usize) -> Result<RgbdFrame>;
}

/// Sequence positions selected by `start`, `end`, `stride` and `num_frames`
pub fn select_indices(
    total: usize,
    start: usize,
    end: Option<usize>,
    stride: usize,
    num_frames: Option<usize>,
) -> Vec<usize> {
    let end = end.unwrap_or(total).min(total);
    let mut indices: Vec<usize> = (start..end).step_by(stride.max(1)).collect();
    if let Some(n) = num_frames {
        indices.truncate(n);
    }
    indices
}
