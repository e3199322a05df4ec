//! RustSplat - incremental RGB-D reconstruction with 3D Gaussian primitives
//!
//! Each incoming frame is tracked against renders of the current map, the
//! map is refined over an overlap-ranked set of keyframes, and primitives are
//! added, pruned and densified as the scene is explored. Rasterization is
//! supplied by the caller through [`fusion::Renderer`].
//!
//! # Modules
//!
//! - `core`: cameras, poses, RGB-D frames and trajectories
//! - `fusion`: primitives, the primitive store, loss and optimizer
//! - `tracker`: per-frame pose estimation
//! - `mapping`: keyframes, map expansion, map optimization and lifecycle
//! - `pipeline`: the frame loop, checkpoints, evaluation and prefetch
//! - `io`: dataset loading
//! - `config`: typed configuration

pub mod config;
pub mod core;
pub mod fusion;
pub mod io;
pub mod mapping;
pub mod pipeline;
pub mod test_utils;
pub mod tracker;

pub use config::{ConfigLoader, SlamConfig};
pub use pipeline::{FrameLoop, RunSummary, SlamError};
