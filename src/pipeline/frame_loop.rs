//! Top-level driver: tracking, expansion, mapping, keyframes and checkpoints
//! for each incoming frame.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{ConfigError, SlamConfig};
use crate::core::{Camera, CameraPose, RelativePoseNormalizer, RgbdFrame, Trajectory};
use crate::fusion::init::{initial_scales, primitives_from_points, scene_radius, unproject_view, NeighborScaleLimits};
use crate::fusion::{PrimitiveStore, RenderError, Renderer};
use crate::io::{Dataset, DatasetError};
use crate::mapping::{
    resolve_working_set, Keyframe, KeyframeDecision, KeyframeManager, MapExpander, MapOptimizer,
    MappingOutcome, MappingTarget,
};
use crate::tracker::{PoseEstimator, TrackingOutcome};

use super::checkpoint::{
    checkpoint_path, load_checkpoint, load_latest_checkpoint, CheckpointError, CheckpointManager,
    CheckpointScene, SlamCheckpoint,
};
use super::eval::{evaluate_frame, FrameMetrics};
use super::prefetch::FramePrefetcher;

/// Fatal frame-loop errors
#[derive(Debug, Error)]
pub enum SlamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Scene metadata fixed by the first frame
#[derive(Debug, Clone, Copy)]
struct SceneInfo {
    first_frame: usize,
    scene_radius: f32,
    camera: Camera,
    densify_camera: Camera,
}

/// Accumulated wall-clock time of the two optimization stages
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    pub tracking_time: Duration,
    pub tracking_iterations: usize,
    pub tracking_frames: usize,
    pub mapping_time: Duration,
    pub mapping_iterations: usize,
    pub mapping_frames: usize,
}

impl FrameTimings {
    fn per(total: Duration, count: usize) -> f64 {
        if count == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / count as f64
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Average Tracking/Iteration Time: {:.3} ms, Average Tracking/Frame Time: {:.3} ms",
            Self::per(self.tracking_time, self.tracking_iterations),
            Self::per(self.tracking_time, self.tracking_frames)
        );
        info!(
            "Average Mapping/Iteration Time: {:.3} ms, Average Mapping/Frame Time: {:.3} ms",
            Self::per(self.mapping_time, self.mapping_iterations),
            Self::per(self.mapping_time, self.mapping_frames)
        );
    }
}

/// What happened to one processed frame
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame_index: usize,
    pub pose: CameraPose,
    /// `None` for the first frame and for ground-truth poses
    pub tracking: Option<TrackingOutcome>,
    /// `None` when the frame was not mapped
    pub mapping: Option<MappingOutcome>,
    /// Primitives created for this frame (initialization or expansion)
    pub added: usize,
    pub keyframe: KeyframeDecision,
    pub checkpoint: Option<PathBuf>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames_processed: usize,
    /// Frames that failed to load
    pub frames_skipped: Vec<usize>,
    /// Frame the run resumed after
    pub resumed_from: Option<usize>,
    pub cancelled: bool,
    pub eval_failures: usize,
    pub final_checkpoint: Option<PathBuf>,
}

/// Run state of one reconstruction session.
pub struct FrameLoop<R: Renderer> {
    config: SlamConfig,
    renderer: R,
    store: PrimitiveStore,
    trajectory: Trajectory,
    normalizer: RelativePoseNormalizer,
    tracker: PoseEstimator,
    keyframes: KeyframeManager,
    mapper: MapOptimizer,
    expander: MapExpander,
    checkpoints: CheckpointManager,
    scene: Option<SceneInfo>,
    metrics: Vec<(String, FrameMetrics)>,
    timings: FrameTimings,
    eval_failures: usize,
    stop: Arc<AtomicBool>,
}

impl<R: Renderer> FrameLoop<R> {
    /// Validate `config` and set up an empty session writing into `config.output_dir()`
    pub fn new(config: SlamConfig, renderer: R) -> Result<Self, SlamError> {
        Self::with_stop_flag(config, renderer, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`FrameLoop::new`], observing an externally owned stop flag
    pub fn with_stop_flag(config: SlamConfig, renderer: R, stop: Arc<AtomicBool>) -> Result<Self, SlamError> {
        config.validate()?;
        let interval = if config.checkpoint.save_checkpoints {
            config.checkpoint.checkpoint_interval
        } else {
            0
        };
        let checkpoints = CheckpointManager::new(config.output_dir().join("checkpoints"), interval);
        let mapper = MapOptimizer::new(
            config.mapping.clone(),
            config.gaussian_distribution,
            config.lifecycle_clock,
            0.0,
            config.seed,
        );

        Ok(Self {
            tracker: PoseEstimator::new(config.tracking.clone()),
            keyframes: KeyframeManager::new(config.keyframe_every, config.mapping.overlap.clone()),
            expander: MapExpander::new(config.mapping.sil_thres, config.mean_sq_dist_method),
            mapper,
            checkpoints,
            renderer,
            store: PrimitiveStore::new(),
            trajectory: Trajectory::new(),
            normalizer: RelativePoseNormalizer::new(),
            scene: None,
            metrics: Vec::new(),
            timings: FrameTimings::default(),
            eval_failures: 0,
            stop,
            config,
        })
    }

    /// Flag checked between frames; raising it ends the run after the current frame
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn store(&self) -> &PrimitiveStore {
        &self.store
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn keyframes(&self) -> &KeyframeManager {
        &self.keyframes
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn metrics(&self) -> &[(String, FrameMetrics)] {
        &self.metrics
    }

    pub fn timings(&self) -> &FrameTimings {
        &self.timings
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoints.dir().to_path_buf()
    }

    pub fn scene_radius(&self) -> Option<f32> {
        self.scene.map(|s| s.scene_radius)
    }

    /// Process every frame of `dataset`, resuming from a checkpoint when configured.
    pub fn run<D: Dataset + Sync>(&mut self, dataset: &D) -> Result<RunSummary, SlamError> {
        let mut summary = RunSummary::default();
        if self.config.checkpoint.load_checkpoint {
            summary.resumed_from = self.resume(dataset)?;
        }

        let first_index = summary.resumed_from.map_or(0, |t| t + 1);
        let indices: Vec<usize> = (first_index..dataset.len()).collect();
        let last_index = dataset.len().checked_sub(1);
        info!(
            "processing {} frames of {} ({} primitives in the map)",
            indices.len(),
            dataset.len(),
            self.store.len()
        );

        let stop = Arc::clone(&self.stop);
        let prefetcher = FramePrefetcher::new(dataset, self.config.data.prefetch_frames, &stop);
        let completed = prefetcher.for_each(&indices, |index, loaded| -> Result<(), SlamError> {
            match loaded {
                Ok(frame) => {
                    let report = self.process_frame(&frame, Some(index) == last_index)?;
                    summary.frames_processed += 1;
                    info!(
                        "frame {}: {} primitives, {} keyframes{}",
                        report.frame_index,
                        self.store.len(),
                        self.keyframes.len(),
                        if report.added > 0 { format!(", +{}", report.added) } else { String::new() }
                    );
                }
                Err(err) => {
                    warn!("skipping frame {}: {}", index, err);
                    summary.frames_skipped.push(index);
                }
            }
            Ok(())
        })?;
        summary.cancelled = !completed;
        if summary.cancelled {
            info!("stop requested, ending run after {} frames", summary.frames_processed);
        }

        if let Some(last) = self.trajectory.iter().map(|(t, _)| t).last() {
            let checkpoint = self.snapshot(last);
            summary.final_checkpoint = Some(self.checkpoints.save(&checkpoint)?);
        }
        summary.eval_failures = self.eval_failures;
        self.timings.log_summary();
        Ok(summary)
    }

    /// Track, map and bookkeep one frame
    pub fn process_frame(&mut self, frame: &RgbdFrame, is_last: bool) -> Result<FrameReport, SlamError> {
        let t = frame.index;
        let gt_pose = frame.gt_c2w.map(|c2w| self.normalizer.relative_w2c(c2w));
        let is_first = self.scene.map_or(true, |s| s.first_frame == t);
        let mut added = 0;
        let mut tracking = None;

        let pose = if self.scene.is_none() {
            let pose = gt_pose.unwrap_or_else(CameraPose::identity);
            added = self.initialize(frame, &pose);
            pose
        } else {
            match gt_pose.filter(|_| self.config.tracking.use_gt_poses) {
                Some(gt) => gt,
                None => {
                    if self.config.tracking.use_gt_poses {
                        warn!("frame {} has no ground-truth pose, tracking instead", t);
                    }
                    let outcome = self.track(frame)?;
                    tracking = Some(outcome);
                    outcome.pose
                }
            }
        };
        self.trajectory.insert(t, pose);

        let report_every = self.config.report_global_progress_every;
        let report_progress = is_first || (t + 1) % report_every == 0;
        if report_progress {
            self.report(frame, &pose, gt_pose.as_ref(), "tracking")?;
        }

        let mut mapping = None;
        if is_first || (t + 1) % self.config.map_every == 0 {
            self.settle_scene_radius(frame);
            if !is_first && self.config.mapping.add_new_gaussians {
                added += self.expander.expand(
                    &mut self.renderer,
                    &mut self.store,
                    frame.expansion_view(),
                    &pose,
                    t,
                )?;
            }
            mapping = Some(self.map(frame, &pose)?);
            if report_progress {
                self.report(frame, &pose, gt_pose.as_ref(), "mapping")?;
            }
        }

        let keyframe = self.keyframes.decide(t, is_first, is_last, &pose, gt_pose.as_ref());
        match keyframe {
            KeyframeDecision::Admit => {
                self.keyframes.push(Keyframe {
                    frame_index: t,
                    pose,
                    view: frame.view.clone(),
                });
            }
            KeyframeDecision::RejectNonFinite => {
                warn!("frame {}: non-finite pose, not admitted as keyframe", t);
            }
            KeyframeDecision::Skip => {}
        }

        let Self {
            checkpoints,
            store,
            trajectory,
            keyframes,
            mapper,
            scene,
            normalizer,
            ..
        } = self;
        let checkpoint = checkpoints.maybe_save(t, || {
            build_checkpoint(t, store, trajectory, keyframes, mapper, scene.as_ref(), normalizer)
        })?;
        if let Some(path) = &checkpoint {
            debug!("saved checkpoint {}", path.display());
        }

        Ok(FrameReport {
            frame_index: t,
            pose,
            tracking,
            mapping,
            added,
            keyframe,
            checkpoint,
        })
    }

    /// Seed the map from the first readable frame
    fn initialize(&mut self, frame: &RgbdFrame, pose: &CameraPose) -> usize {
        let view = frame.expansion_view();
        let radius = scene_radius(view, self.config.scene_radius_depth_ratio);
        self.scene = Some(SceneInfo {
            first_frame: frame.index,
            scene_radius: radius,
            camera: frame.view.camera,
            densify_camera: view.camera,
        });
        self.mapper.lifecycle_mut().set_scene_radius(radius);

        let points = unproject_view(view, pose, None);
        let scales = initial_scales(
            &points,
            view.camera.mean_focal(),
            self.config.mean_sq_dist_method,
            &NeighborScaleLimits::default(),
        );
        let added = self.store.extend(primitives_from_points(&points, &scales), frame.index);
        if radius <= 0.0 {
            warn!("frame {} has no valid depth, map seeding deferred to later frames", frame.index);
        }
        info!(
            "initialized map from frame {}: {} primitives, scene radius {:.3}",
            frame.index, added, radius
        );
        added
    }

    /// Take the scene radius from the first mapped frame that observes depth
    fn settle_scene_radius(&mut self, frame: &RgbdFrame) {
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        if scene.scene_radius > 0.0 {
            return;
        }
        let radius = scene_radius(frame.expansion_view(), self.config.scene_radius_depth_ratio);
        if radius > 0.0 {
            scene.scene_radius = radius;
            self.mapper.lifecycle_mut().set_scene_radius(radius);
            info!("scene radius {:.3} taken from frame {}", radius, frame.index);
        }
    }

    fn track(&mut self, frame: &RgbdFrame) -> Result<TrackingOutcome, SlamError> {
        let initial = self.tracker.initial_pose(&self.trajectory, frame.index);
        let start = Instant::now();
        let outcome = self.tracker.estimate(&mut self.renderer, &self.store, &frame.view, initial)?;
        self.timings.tracking_time += start.elapsed();
        self.timings.tracking_iterations += outcome.iterations;
        self.timings.tracking_frames += 1;
        debug!(
            "frame {}: tracked in {} iterations, loss {:.5}{}",
            frame.index,
            outcome.iterations,
            outcome.best_loss,
            if outcome.extended { " (extended)" } else { "" }
        );
        Ok(outcome)
    }

    fn map(&mut self, frame: &RgbdFrame, pose: &CameraPose) -> Result<MappingOutcome, SlamError> {
        let entries = self
            .keyframes
            .working_set(&frame.view, pose, self.config.mapping_window_size);
        let live = MappingTarget {
            frame_index: frame.index,
            view: &frame.view,
            pose: *pose,
        };
        let targets = resolve_working_set(&self.keyframes, &entries, live);

        let start = Instant::now();
        let outcome = self
            .mapper
            .optimize(&mut self.renderer, &mut self.store, &targets, frame.index)?;
        self.timings.mapping_time += start.elapsed();
        self.timings.mapping_iterations += outcome.iterations;
        self.timings.mapping_frames += 1;

        let lc = outcome.lifecycle;
        if !lc.is_empty() {
            debug!(
                "frame {}: pruned {}, cloned {}, split {}, removed {}, opacity resets {}",
                frame.index, lc.pruned, lc.cloned, lc.split, lc.densify_removed, lc.opacity_resets
            );
        }
        Ok(outcome)
    }

    /// Evaluate progress; a failed evaluation writes an emergency checkpoint
    fn report(
        &mut self,
        frame: &RgbdFrame,
        pose: &CameraPose,
        gt: Option<&CameraPose>,
        stage: &str,
    ) -> Result<(), SlamError> {
        match evaluate_frame(&mut self.renderer, &self.store, frame, pose, gt) {
            Ok(metrics) => {
                metrics.log(stage);
                self.metrics.push((stage.to_string(), metrics));
            }
            Err(err) => {
                self.eval_failures += 1;
                let checkpoint = self.snapshot(frame.index);
                let path = self.checkpoints.save(&checkpoint)?;
                warn!(
                    "evaluation after {} failed at frame {}: {}; saved {}",
                    stage,
                    frame.index,
                    err,
                    path.display()
                );
            }
        }
        Ok(())
    }

    fn snapshot(&self, frame_index: usize) -> SlamCheckpoint {
        build_checkpoint(
            frame_index,
            &self.store,
            &self.trajectory,
            &self.keyframes,
            &self.mapper,
            self.scene.as_ref(),
            &self.normalizer,
        )
    }

    /// Restore state from the configured checkpoint; returns the frame it was taken after.
    ///
    /// Keyframe images are reloaded from `dataset`.
    pub fn resume<D: Dataset>(&mut self, dataset: &D) -> Result<Option<usize>, SlamError> {
        let checkpoint = match self.config.checkpoint.checkpoint_time_idx {
            Some(t) => load_checkpoint(&checkpoint_path(self.checkpoints.dir(), t))?,
            None => match load_latest_checkpoint(self.checkpoints.dir())? {
                Some(checkpoint) => checkpoint,
                None => {
                    warn!("no checkpoint in {}, starting fresh", self.checkpoints.dir().display());
                    return Ok(None);
                }
            },
        };

        self.store = checkpoint.to_store()?;
        self.trajectory = checkpoint.to_trajectory();
        self.mapper.optimizer_mut().set_step_count(checkpoint.optimizer_step);
        self.mapper.lifecycle_mut().set_global_iteration(checkpoint.lifecycle_iteration);
        self.mapper.lifecycle_mut().set_scene_radius(checkpoint.scene.scene_radius);
        self.normalizer = checkpoint
            .scene
            .anchor()
            .map_or_else(RelativePoseNormalizer::new, RelativePoseNormalizer::with_anchor);

        let first_frame = self.trajectory.iter().map(|(t, _)| t).next().unwrap_or(0);
        self.scene = Some(SceneInfo {
            first_frame,
            scene_radius: checkpoint.scene.scene_radius,
            camera: checkpoint.scene.intrinsics,
            densify_camera: checkpoint.scene.densify_intrinsics,
        });

        self.keyframes = KeyframeManager::new(self.config.keyframe_every, self.config.mapping.overlap.clone());
        for &index in &checkpoint.keyframe_indices {
            let Some(pose) = self.trajectory.get(index).copied() else {
                warn!("checkpoint keyframe {} has no pose, dropped", index);
                continue;
            };
            let frame = dataset.load_frame(index)?;
            self.keyframes.push(Keyframe {
                frame_index: index,
                pose,
                view: frame.view,
            });
        }

        info!(
            "resumed after frame {}: {} primitives, {} poses, {} keyframes",
            checkpoint.frame_index,
            self.store.len(),
            self.trajectory.len(),
            self.keyframes.len()
        );
        Ok(Some(checkpoint.frame_index))
    }
}

fn build_checkpoint(
    frame_index: usize,
    store: &PrimitiveStore,
    trajectory: &Trajectory,
    keyframes: &KeyframeManager,
    mapper: &MapOptimizer,
    scene: Option<&SceneInfo>,
    normalizer: &RelativePoseNormalizer,
) -> SlamCheckpoint {
    let default_camera = Camera::new(1.0, 1.0, 0.0, 0.0, 0, 0);
    let scene = CheckpointScene {
        scene_radius: scene.map_or(0.0, |s| s.scene_radius),
        intrinsics: scene.map_or(default_camera, |s| s.camera),
        densify_intrinsics: scene.map_or(default_camera, |s| s.densify_camera),
        gt_anchor: normalizer.anchor().map(|m| m.to_cols_array()),
    };
    SlamCheckpoint::capture(
        frame_index,
        store,
        mapper.optimizer().step_count(),
        mapper.lifecycle().global_iteration(),
        trajectory,
        keyframes.frame_indices(),
        scene,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{plane_view, PlaneRenderer, SyntheticDataset};

    fn config(dir: &std::path::Path) -> SlamConfig {
        let mut config = SlamConfig::new(dir, "test");
        config.tracking.num_iters = 3;
        config.mapping.num_iters = 2;
        config.mapping.pruning.start_after = 100;
        config.mapping.pruning.stop_after = 200;
        config.data.prefetch_frames = 0;
        config.checkpoint.save_checkpoints = false;
        config
    }

    #[test]
    fn test_first_frame_initializes_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut slam = FrameLoop::new(config(dir.path()), PlaneRenderer::new(2.0, [0.5; 3])).unwrap();
        let frame = RgbdFrame::new(0, plane_view(8, 6, 2.0, [0.5; 3]));

        let report = slam.process_frame(&frame, false).unwrap();
        assert_eq!(report.added, 48);
        assert!(report.tracking.is_none());
        assert_eq!(report.mapping.unwrap().iterations, 2);
        assert_eq!(report.keyframe, KeyframeDecision::Admit);
        assert_eq!(slam.store().len(), 48);
        assert!((slam.scene_radius().unwrap() - 2.0 / 3.0).abs() < 1e-5);
        assert_eq!(slam.trajectory().get(0), Some(&CameraPose::identity()));
    }

    #[test]
    fn test_later_frames_are_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut slam = FrameLoop::new(config(dir.path()), PlaneRenderer::new(2.0, [0.5; 3])).unwrap();
        let dataset = SyntheticDataset::plane_sequence(3, 8, 6, 2.0, None);
        slam.process_frame(&dataset.load_frame(0).unwrap(), false).unwrap();

        let report = slam.process_frame(&dataset.load_frame(1).unwrap(), false).unwrap();
        assert_eq!(report.tracking.unwrap().iterations, 3);
        assert_eq!(report.keyframe, KeyframeDecision::Skip);
        assert_eq!(slam.trajectory().len(), 2);
        assert_eq!(slam.renderer().backward_calls(), 3 + 2 + 2);
        // checkpoints are off and no evaluation failed
        assert!(!slam.checkpoint_dir().exists());
    }

    #[test]
    fn test_depthless_first_frame_defers_scene_radius() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SlamConfig::new(dir.path(), "test");
        config.tracking.num_iters = 3;
        config.mapping.num_iters = 2;
        config.data.prefetch_frames = 0;
        config.checkpoint.save_checkpoints = false;
        // default pruning removes oversized primitives from the first mapping iteration
        let mut dataset = SyntheticDataset::plane_sequence(3, 64, 48, 2.0, None);
        dataset.set_view(0, plane_view(64, 48, 0.0, [0.5; 3]));

        let mut slam = FrameLoop::new(config, PlaneRenderer::new(2.0, [0.5; 3])).unwrap();
        let summary = slam.run(&dataset).unwrap();

        assert_eq!(summary.frames_processed, 3);
        assert_eq!(slam.store().len(), 64 * 48);
        assert!((slam.scene_radius().unwrap() - 2.0 / 3.0).abs() < 1e-5);
        assert!(!slam.store().is_empty());
        assert!(slam.store().entries().iter().all(|e| e.birth_frame >= 1));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.map_every = 0;
        assert!(matches!(
            FrameLoop::new(config, PlaneRenderer::new(2.0, [0.5; 3])),
            Err(SlamError::Config(_))
        ));
    }

    #[test]
    fn test_render_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = PlaneRenderer::new(2.0, [0.5; 3]);
        renderer.fail_after(4);
        let mut slam = FrameLoop::new(config(dir.path()), renderer).unwrap();
        let dataset = SyntheticDataset::plane_sequence(3, 8, 6, 2.0, None);
        assert!(matches!(slam.run(&dataset), Err(SlamError::Render(_))));
    }
}
