//! Core data structures for RustSplat

pub mod camera;
pub mod frame;
pub mod pose;
pub mod trajectory;

pub use camera::Camera;
pub use frame::{ColorImage, DepthImage, RgbdFrame, RgbdView};
pub use pose::CameraPose;
pub use trajectory::{RelativePoseNormalizer, Trajectory};
