//! Frame loop orchestration: the per-frame driver, checkpoints, progress
//! evaluation and frame prefetching

pub mod checkpoint;
pub mod eval;
pub mod frame_loop;
pub mod prefetch;

pub use checkpoint::{
    checkpoint_path, load_checkpoint, load_latest_checkpoint, save_checkpoint, CheckpointError,
    CheckpointManager, SlamCheckpoint,
};
pub use eval::{evaluate_frame, EvalError, FrameMetrics};
pub use frame_loop::{FrameLoop, FrameReport, FrameTimings, RunSummary, SlamError};
pub use prefetch::FramePrefetcher;
