//! Camera tracking

pub mod pose_estimator;

pub use pose_estimator::{PoseEstimator, TrackingOutcome};
