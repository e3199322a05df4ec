//! Map building: keyframes, expansion, refinement and primitive lifecycle

pub mod expansion;
pub mod keyframes;
pub mod lifecycle;
pub mod map_optimizer;

pub use expansion::{unexplained_mask, MapExpander};
pub use keyframes::{Keyframe, KeyframeDecision, KeyframeManager, WorkingEntry};
pub use lifecycle::{LifecycleReport, PrimitiveLifecycleManager};
pub use map_optimizer::{resolve_working_set, MapOptimizer, MappingOutcome, MappingTarget};
