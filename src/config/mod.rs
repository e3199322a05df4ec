//! Configuration module for RustSplat
//!
//! Typed, validated configuration for every stage of the frame loop.

#[allow(clippy::module_inception)]
pub mod config;
pub mod params;

pub use config::{ConfigError, ConfigLoader, SlamConfig};
pub use params::{
    CheckpointParams, DataParams, DensifySchedule, GaussianDistribution, LifecycleClock, LossWeights,
    MappingParams, OverlapParams, PoseLearningRates, PrimitiveLearningRates, PruneSchedule,
    ScaleInitMethod, TrackingParams,
};
