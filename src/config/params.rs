//! Parameter structures for the tracking and mapping stages

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the initial size of a new primitive is estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleInitMethod {
    /// Pixel footprint at the observed depth: `depth / mean_focal`
    Projective,
    /// Half the distance to the nearest neighbouring point
    NearestNeighbor,
}

/// Whether primitives keep one scale or three
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaussianDistribution {
    Isotropic,
    Anisotropic,
}

/// Iteration counter that drives the lifecycle schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleClock {
    /// Mapping iteration within the current frame, restarting at 0 each frame
    PerFrame,
    /// Mapping iterations summed over the whole run
    Global,
}

/// Relative weights of the loss terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossWeights {
    /// Photometric term
    pub im: f32,
    /// Depth term
    pub depth: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self { im: 0.5, depth: 1.0 }
    }
}

/// Learning rates of the camera pose parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoseLearningRates {
    pub cam_unnorm_rots: f32,
    pub cam_trans: f32,
}

impl Default for PoseLearningRates {
    fn default() -> Self {
        Self {
            cam_unnorm_rots: 0.0004,
            cam_trans: 0.002,
        }
    }
}

/// Learning rates of the primitive parameter groups
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrimitiveLearningRates {
    #[serde(alias = "means3D")]
    pub means3d: f32,
    pub rgb_colors: f32,
    pub unnorm_rotations: f32,
    pub logit_opacities: f32,
    pub log_scales: f32,
}

impl Default for PrimitiveLearningRates {
    fn default() -> Self {
        Self {
            means3d: 0.0001,
            rgb_colors: 0.0025,
            unnorm_rotations: 0.001,
            logit_opacities: 0.05,
            log_scales: 0.001,
        }
    }
}

/// Camera tracking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingParams {
    /// Copy ground-truth poses instead of optimizing
    pub use_gt_poses: bool,
    /// Initialize with constant-velocity extrapolation instead of the previous pose
    pub forward_prop: bool,
    /// Optimization iterations per frame
    pub num_iters: usize,
    /// Gate the loss with the rendered silhouette
    pub use_sil_for_loss: bool,
    /// Silhouette threshold for the gate
    pub sil_thres: f32,
    /// L1 (true) or L2 (false) errors
    pub use_l1: bool,
    /// Drop pixels whose depth error exceeds 10x the median
    pub ignore_outlier_depth_loss: bool,
    /// Double the budget once when the final depth loss is above `depth_loss_thres`
    pub use_depth_loss_thres: bool,
    pub depth_loss_thres: f32,
    pub loss_weights: LossWeights,
    pub lrs: PoseLearningRates,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            use_gt_poses: false,
            forward_prop: true,
            num_iters: 40,
            use_sil_for_loss: true,
            sil_thres: 0.99,
            use_l1: true,
            ignore_outlier_depth_loss: false,
            use_depth_loss_thres: false,
            depth_loss_thres: 20000.0,
            loss_weights: LossWeights::default(),
            lrs: PoseLearningRates::default(),
        }
    }
}

/// Pruning schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PruneSchedule {
    pub start_after: u64,
    /// Iteration from which oversized primitives are removed as well
    pub remove_big_after: u64,
    #[serde(alias = "stop_pruning_after")]
    pub stop_after: u64,
    pub prune_every: u64,
    /// Opacity threshold at `start_after`
    pub removal_opacity_threshold: f32,
    /// Opacity threshold reached at `stop_after`
    pub final_removal_opacity_threshold: f32,
    pub reset_opacities: bool,
    pub reset_opacities_every: u64,
    /// Opacity assigned on reset
    pub reset_opacity_value: f32,
    /// Oversized means max scale above this fraction of the scene radius
    pub big_scale_ratio: f32,
}

impl Default for PruneSchedule {
    fn default() -> Self {
        Self {
            start_after: 0,
            remove_big_after: 0,
            stop_after: 20,
            prune_every: 20,
            removal_opacity_threshold: 0.005,
            final_removal_opacity_threshold: 0.005,
            reset_opacities: false,
            reset_opacities_every: 500,
            reset_opacity_value: 0.01,
            big_scale_ratio: 0.1,
        }
    }
}

/// Densification schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DensifySchedule {
    pub start_after: u64,
    pub remove_big_after: u64,
    #[serde(alias = "stop_densifying_after")]
    pub stop_after: u64,
    pub densify_every: u64,
    /// Minimum mean screen-space gradient norm for a primitive to grow
    pub grad_thresh: f32,
    pub num_to_split_into: usize,
    /// Primitives larger than this fraction of the scene radius split, smaller ones clone
    pub split_scale_ratio: f32,
    pub big_scale_ratio: f32,
    pub removal_opacity_threshold: f32,
    pub final_removal_opacity_threshold: f32,
    pub reset_opacities: bool,
    pub reset_opacities_every: u64,
    pub reset_opacity_value: f32,
}

impl Default for DensifySchedule {
    fn default() -> Self {
        Self {
            start_after: 500,
            remove_big_after: 3000,
            stop_after: 15000,
            densify_every: 100,
            grad_thresh: 0.0002,
            num_to_split_into: 2,
            split_scale_ratio: 0.01,
            big_scale_ratio: 0.1,
            removal_opacity_threshold: 0.005,
            final_removal_opacity_threshold: 0.005,
            reset_opacities: true,
            reset_opacities_every: 3000,
            reset_opacity_value: 0.01,
        }
    }
}

/// Keyframe overlap scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlapParams {
    /// Depth pixels sampled from the current frame
    pub pixel_samples: usize,
    /// Reprojections closer than this to the image border do not count
    pub edge_margin: f32,
    /// Relative depth agreement required with the keyframe's depth map; 0 disables the check
    pub depth_tolerance: f32,
}

impl Default for OverlapParams {
    fn default() -> Self {
        Self {
            pixel_samples: 1600,
            edge_margin: 20.0,
            depth_tolerance: 0.1,
        }
    }
}

/// Map optimization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingParams {
    /// Optimization iterations per mapped frame
    pub num_iters: usize,
    /// Seed new primitives where the map does not explain the frame
    pub add_new_gaussians: bool,
    /// Silhouette below which a pixel counts as unexplained
    pub sil_thres: f32,
    pub use_l1: bool,
    pub use_sil_for_loss: bool,
    pub ignore_outlier_depth_loss: bool,
    /// Drop Adam moments before each frame's mapping pass
    pub reset_optimizer_each_frame: bool,
    pub prune_gaussians: bool,
    pub use_gaussian_splatting_densification: bool,
    pub loss_weights: LossWeights,
    pub lrs: PrimitiveLearningRates,
    #[serde(alias = "pruning_dict")]
    pub pruning: PruneSchedule,
    #[serde(alias = "densify_dict")]
    pub densify: DensifySchedule,
    pub overlap: OverlapParams,
}

impl Default for MappingParams {
    fn default() -> Self {
        Self {
            num_iters: 60,
            add_new_gaussians: true,
            sil_thres: 0.5,
            use_l1: true,
            use_sil_for_loss: false,
            ignore_outlier_depth_loss: false,
            reset_optimizer_each_frame: true,
            prune_gaussians: true,
            use_gaussian_splatting_densification: false,
            loss_weights: LossWeights::default(),
            lrs: PrimitiveLearningRates::default(),
            pruning: PruneSchedule::default(),
            densify: DensifySchedule::default(),
            overlap: OverlapParams::default(),
        }
    }
}

/// Input sequence parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataParams {
    /// Directory holding capture sessions
    pub basedir: PathBuf,
    /// Session folder under `basedir`
    pub sequence: String,
    pub desired_image_width: u32,
    pub desired_image_height: u32,
    /// Resolution of the view used for map expansion; defaults to the tracking resolution
    pub densification_image_width: Option<u32>,
    pub densification_image_height: Option<u32>,
    pub start: usize,
    /// Exclusive end index; `None` reads to the end
    pub end: Option<usize>,
    pub stride: usize,
    /// Cap on the number of frames; `None` for no cap
    pub num_frames: Option<usize>,
    /// Frames decoded ahead on a loader thread; 0 loads inline
    pub prefetch_frames: usize,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            basedir: PathBuf::from("."),
            sequence: String::new(),
            desired_image_width: 256,
            desired_image_height: 192,
            densification_image_width: None,
            densification_image_height: None,
            start: 0,
            end: None,
            stride: 1,
            num_frames: None,
            prefetch_frames: 2,
        }
    }
}

/// Checkpoint parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointParams {
    pub save_checkpoints: bool,
    /// Save when `frame_index % checkpoint_interval == 0`
    pub checkpoint_interval: usize,
    /// Resume from a checkpoint in the output directory
    pub load_checkpoint: bool,
    /// Checkpoint to resume from; latest when `None`
    pub checkpoint_time_idx: Option<usize>,
}

impl Default for CheckpointParams {
    fn default() -> Self {
        Self {
            save_checkpoints: true,
            checkpoint_interval: 100,
            load_checkpoint: false,
            checkpoint_time_idx: None,
        }
    }
}
