//! Input sequences

pub mod capture;
pub mod dataset;

pub use capture::{CaptureDataset, CaptureManifest};
pub use dataset::{Dataset, DatasetError};
