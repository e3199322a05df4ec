//! Main configuration structures for RustSplat

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::params::*;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn default_seed() -> u64 {
    0
}
fn default_every() -> usize {
    1
}
fn default_keyframe_every() -> usize {
    5
}
fn default_window() -> usize {
    24
}
fn default_report_every() -> usize {
    500
}
fn default_depth_ratio() -> f32 {
    3.0
}
fn default_scale_init() -> ScaleInitMethod {
    ScaleInitMethod::Projective
}
fn default_distribution() -> GaussianDistribution {
    GaussianDistribution::Isotropic
}
fn default_clock() -> LifecycleClock {
    LifecycleClock::PerFrame
}

/// Main SLAM configuration.
///
/// `workdir` and `run_name` are required; every other key falls back to its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlamConfig {
    /// Root directory for outputs
    pub workdir: PathBuf,
    /// Run name; outputs go to `workdir/run_name`
    pub run_name: String,
    /// Seed for working-set sampling and split perturbations
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Map when `(t + 1) % map_every == 0`
    #[serde(default = "default_every")]
    pub map_every: usize,
    /// Admit a keyframe when `(t + 1) % keyframe_every == 0`
    #[serde(default = "default_keyframe_every")]
    pub keyframe_every: usize,
    /// Working set size including the latest keyframe and the live frame
    #[serde(default = "default_window")]
    pub mapping_window_size: usize,
    /// Evaluate at frame 0 and when `(t + 1) % report_global_progress_every == 0`
    #[serde(default = "default_report_every")]
    pub report_global_progress_every: usize,
    /// Scene radius = max depth of the first frame / ratio
    #[serde(default = "default_depth_ratio")]
    pub scene_radius_depth_ratio: f32,
    #[serde(default = "default_scale_init")]
    pub mean_sq_dist_method: ScaleInitMethod,
    #[serde(default = "default_distribution")]
    pub gaussian_distribution: GaussianDistribution,
    #[serde(default = "default_clock")]
    pub lifecycle_clock: LifecycleClock,
    #[serde(default)]
    pub checkpoint: CheckpointParams,
    #[serde(default)]
    pub data: DataParams,
    #[serde(default)]
    pub tracking: TrackingParams,
    #[serde(default)]
    pub mapping: MappingParams,
}

impl SlamConfig {
    /// Configuration with every optional key at its default
    pub fn new<P: Into<PathBuf>>(workdir: P, run_name: &str) -> Self {
        Self {
            workdir: workdir.into(),
            run_name: run_name.to_string(),
            seed: default_seed(),
            map_every: default_every(),
            keyframe_every: default_keyframe_every(),
            mapping_window_size: default_window(),
            report_global_progress_every: default_report_every(),
            scene_radius_depth_ratio: default_depth_ratio(),
            mean_sq_dist_method: default_scale_init(),
            gaussian_distribution: default_distribution(),
            lifecycle_clock: default_clock(),
            checkpoint: CheckpointParams::default(),
            data: DataParams::default(),
            tracking: TrackingParams::default(),
            mapping: MappingParams::default(),
        }
    }

    /// Output directory of this run
    pub fn output_dir(&self) -> PathBuf {
        self.workdir.join(&self.run_name)
    }

    /// Offline reconstruction of an iPhone LiDAR capture with trusted poses
    pub fn iphone_offline<P: Into<PathBuf>>(workdir: P, run_name: &str) -> Self {
        Self {
            map_every: 1,
            keyframe_every: 1,
            mapping_window_size: 24,
            report_global_progress_every: 50,
            scene_radius_depth_ratio: 3.0,
            mean_sq_dist_method: ScaleInitMethod::Projective,
            gaussian_distribution: GaussianDistribution::Anisotropic,
            data: DataParams {
                desired_image_width: 256,
                desired_image_height: 192,
                densification_image_width: Some(1024),
                densification_image_height: Some(768),
                ..Default::default()
            },
            tracking: TrackingParams {
                use_gt_poses: true,
                num_iters: 10,
                use_sil_for_loss: false,
                lrs: PoseLearningRates {
                    cam_unnorm_rots: 0.0,
                    cam_trans: 0.0,
                },
                loss_weights: LossWeights { im: 0.0, depth: 0.0 },
                ..Default::default()
            },
            mapping: MappingParams {
                num_iters: 120,
                use_gaussian_splatting_densification: true,
                pruning: PruneSchedule {
                    removal_opacity_threshold: 0.4,
                    final_removal_opacity_threshold: 0.6,
                    reset_opacities: true,
                    ..Default::default()
                },
                densify: DensifySchedule {
                    start_after: 100,
                    stop_after: 5000,
                    removal_opacity_threshold: 0.4,
                    final_removal_opacity_threshold: 0.7,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Self::new(workdir, run_name)
        }
    }

    /// Semantic checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }
        fn unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(invalid(field, format!("{value} is outside [0, 1]")))
            }
        }

        if self.run_name.trim().is_empty() {
            return Err(invalid("run_name", "must not be empty"));
        }
        for (field, value) in [
            ("map_every", self.map_every),
            ("keyframe_every", self.keyframe_every),
            ("report_global_progress_every", self.report_global_progress_every),
            ("data.stride", self.data.stride),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        if self.mapping_window_size < 2 {
            return Err(invalid("mapping_window_size", "must be at least 2"));
        }
        if !(self.scene_radius_depth_ratio > 0.0) {
            return Err(invalid("scene_radius_depth_ratio", "must be positive"));
        }
        if self.checkpoint.save_checkpoints && self.checkpoint.checkpoint_interval == 0 {
            return Err(invalid("checkpoint.checkpoint_interval", "must be at least 1"));
        }
        if self.data.desired_image_width == 0 || self.data.desired_image_height == 0 {
            return Err(invalid("data.desired_image_width", "image size must be non-zero"));
        }
        if self.data.densification_image_width.is_some() != self.data.densification_image_height.is_some() {
            return Err(invalid(
                "data.densification_image_width",
                "densification width and height must be given together",
            ));
        }

        unit("tracking.sil_thres", self.tracking.sil_thres)?;
        unit("mapping.sil_thres", self.mapping.sil_thres)?;
        if self.tracking.use_depth_loss_thres && !(self.tracking.depth_loss_thres > 0.0) {
            return Err(invalid("tracking.depth_loss_thres", "must be positive"));
        }

        let p = &self.mapping.pruning;
        if p.start_after > p.stop_after {
            return Err(invalid("mapping.pruning.start_after", "window starts after it stops"));
        }
        if p.prune_every == 0 || p.reset_opacities_every == 0 {
            return Err(invalid("mapping.pruning.prune_every", "cadences must be at least 1"));
        }
        unit("mapping.pruning.removal_opacity_threshold", p.removal_opacity_threshold)?;
        unit("mapping.pruning.final_removal_opacity_threshold", p.final_removal_opacity_threshold)?;
        if !(p.reset_opacity_value > 0.0 && p.reset_opacity_value < 1.0) {
            return Err(invalid("mapping.pruning.reset_opacity_value", "must be inside (0, 1)"));
        }

        let d = &self.mapping.densify;
        if d.start_after > d.stop_after {
            return Err(invalid("mapping.densify.start_after", "window starts after it stops"));
        }
        if d.densify_every == 0 || d.reset_opacities_every == 0 {
            return Err(invalid("mapping.densify.densify_every", "cadences must be at least 1"));
        }
        if d.num_to_split_into < 2 {
            return Err(invalid("mapping.densify.num_to_split_into", "must be at least 2"));
        }
        if !(d.grad_thresh >= 0.0) {
            return Err(invalid("mapping.densify.grad_thresh", "must be non-negative"));
        }
        unit("mapping.densify.removal_opacity_threshold", d.removal_opacity_threshold)?;
        unit("mapping.densify.final_removal_opacity_threshold", d.final_removal_opacity_threshold)?;
        if !(d.reset_opacity_value > 0.0 && d.reset_opacity_value < 1.0) {
            return Err(invalid("mapping.densify.reset_opacity_value", "must be inside (0, 1)"));
        }
        if !(d.split_scale_ratio > 0.0 && d.big_scale_ratio > 0.0 && p.big_scale_ratio > 0.0) {
            return Err(invalid("mapping.densify.split_scale_ratio", "size ratios must be positive"));
        }

        let o = &self.mapping.overlap;
        if o.pixel_samples == 0 {
            return Err(invalid("mapping.overlap.pixel_samples", "must be at least 1"));
        }
        if !(o.edge_margin >= 0.0 && o.depth_tolerance >= 0.0) {
            return Err(invalid("mapping.overlap.edge_margin", "must be non-negative"));
        }

        Ok(())
    }
}

/// Configuration loader supporting YAML and TOML
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from file, choosing the format by extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SlamConfig, ConfigError> {
        let path = path.as_ref();
        let extension = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match extension.to_lowercase().as_str() {
            "yaml" | "yml" => Self::load_yaml(path),
            "toml" => Self::load_toml(path),
            _ => Err(ConfigError::UnsupportedFormat(extension.to_string())),
        }
    }

    /// Load configuration from YAML file
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<SlamConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SlamConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<SlamConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SlamConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn save_yaml<P: AsRef<Path>>(config: &SlamConfig, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_toml<P: AsRef<Path>>(config: &SlamConfig, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
