//! Per-frame camera pose optimization against the current map

use glam::{Quat, Vec3};
use log::debug;

use crate::config::TrackingParams;
use crate::core::{CameraPose, RgbdView, Trajectory};
use crate::fusion::{
    adam_update, compute_loss, AdamConfig, LossSettings, PoseGrad, PrimitiveStore, Reduction,
    RenderError, Renderer,
};

/// Result of tracking one frame
#[derive(Debug, Clone, Copy)]
pub struct TrackingOutcome {
    /// Lowest-loss pose seen during the loop
    pub pose: CameraPose,
    pub best_loss: f32,
    /// Iterations actually run
    pub iterations: usize,
    /// Whether the budget was doubled
    pub extended: bool,
}

/// Adam state for the seven pose parameters
#[derive(Debug, Clone, Default)]
struct PoseAdam {
    m: [f32; 7],
    v: [f32; 7],
    step: u64,
}

impl PoseAdam {
    fn step(&mut self, pose: &mut CameraPose, grad: &PoseGrad, params: &TrackingParams, adam: &AdamConfig) {
        self.step += 1;
        let q = pose.unnormalized_rotation().to_array();
        let t = pose.translation().to_array();
        let mut values = [q[0], q[1], q[2], q[3], t[0], t[1], t[2]];
        let g = grad.rotation;
        let gt = grad.translation;
        let grads = [g[0], g[1], g[2], g[3], gt.x, gt.y, gt.z];

        let lrs = [(0..4, params.lrs.cam_unnorm_rots), (4..7, params.lrs.cam_trans)];
        for (range, lr) in lrs {
            if lr == 0.0 {
                continue;
            }
            adam_update(
                &mut values[range.clone()],
                &grads[range.clone()],
                &mut self.m[range.clone()],
                &mut self.v[range.clone()],
                lr,
                adam,
                self.step,
            );
        }

        pose.set_unnormalized_rotation(Quat::from_xyzw(values[0], values[1], values[2], values[3]));
        pose.set_translation(Vec3::new(values[4], values[5], values[6]));
    }
}

/// Estimates camera poses by gradient descent through the renderer.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    params: TrackingParams,
    adam: AdamConfig,
}

impl PoseEstimator {
    pub fn new(params: TrackingParams) -> Self {
        Self {
            params,
            adam: AdamConfig::default(),
        }
    }

    pub fn params(&self) -> &TrackingParams {
        &self.params
    }

    /// Loss used while tracking: summed over the mask, color masked too
    pub fn loss_settings(&self) -> LossSettings {
        LossSettings {
            use_l1: self.params.use_l1,
            use_sil_for_loss: self.params.use_sil_for_loss,
            sil_thres: self.params.sil_thres,
            ignore_outlier_depth_loss: self.params.ignore_outlier_depth_loss,
            weights: self.params.loss_weights,
            reduction: Reduction::Sum,
            mask_color: true,
        }
    }

    /// Starting pose for `frame_index`.
    ///
    /// With `forward_prop` and two earlier poses the last frame-to-frame
    /// motion is applied again in SE(3): `delta * last` with
    /// `delta = last * before^-1`. Otherwise the previous pose is copied, or
    /// identity if there is none.
    pub fn initial_pose(&self, trajectory: &Trajectory, frame_index: usize) -> CameraPose {
        if self.params.forward_prop {
            if let Some((last, before)) = trajectory.previous_two(frame_index) {
                let delta = last.compose(&before.inverse());
                return delta.compose(last);
            }
        }
        trajectory
            .previous(frame_index)
            .map(|(_, pose)| *pose)
            .unwrap_or_else(CameraPose::identity)
    }

    /// Optimize the pose of one frame, starting from `initial`.
    ///
    /// The map is read-only here. Renderer failures are returned unchanged.
    pub fn estimate<R: Renderer + ?Sized>(
        &self,
        renderer: &mut R,
        store: &PrimitiveStore,
        view: &RgbdView,
        initial: CameraPose,
    ) -> Result<TrackingOutcome, RenderError> {
        let settings = self.loss_settings();
        let mut candidate = initial;
        let mut optimizer = PoseAdam::default();
        let mut best_pose = initial;
        let mut best_loss = f32::INFINITY;

        let mut budget = self.params.num_iters;
        let mut extended = false;
        let mut iter = 0;

        while iter < budget {
            let output = renderer.render(store, &candidate, &view.camera)?;
            let loss = compute_loss(&output, view, &settings)?;
            let grads = renderer.backward(store, &candidate, &view.camera, &output, &loss.grads)?;

            if loss.total < best_loss {
                best_loss = loss.total;
                best_pose = candidate;
            }
            optimizer.step(&mut candidate, &grads.pose, &self.params, &self.adam);
            iter += 1;

            if iter == budget
                && !extended
                && self.params.use_depth_loss_thres
                && loss.depth >= self.params.depth_loss_thres
            {
                debug!(
                    "depth loss {:.4} above {:.4} after {} iterations, extending tracking once",
                    loss.depth, self.params.depth_loss_thres, iter
                );
                budget *= 2;
                extended = true;
            }
        }

        Ok(TrackingOutcome {
            pose: best_pose,
            best_loss,
            iterations: iter,
            extended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{plane_view, PlaneRenderer};

    fn params(num_iters: usize) -> TrackingParams {
        TrackingParams {
            num_iters,
            use_sil_for_loss: false,
            loss_weights: crate::config::LossWeights { im: 0.0, depth: 1.0 },
            lrs: crate::config::PoseLearningRates {
                cam_unnorm_rots: 0.0,
                cam_trans: 0.01,
            },
            ..Default::default()
        }
    }

    fn populated_store() -> PrimitiveStore {
        let mut store = PrimitiveStore::new();
        store.push(crate::fusion::Primitive::new(Vec3::new(0.0, 0.0, 2.0), Vec3::splat(0.5), 0.01, 0.5), 0);
        store
    }

    #[test]
    fn test_tracking_reduces_depth_error() {
        let view = plane_view(8, 6, 2.0, [0.5, 0.5, 0.5]);
        let mut renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
        let store = populated_store();
        let estimator = PoseEstimator::new(params(60));

        let initial = CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, 0.3));
        let outcome = estimator.estimate(&mut renderer, &store, &view, initial).unwrap();

        assert_eq!(outcome.iterations, 60);
        assert!(!outcome.extended);
        assert!(outcome.pose.translation().z.abs() < 0.3);
    }

    #[test]
    fn test_best_so_far_not_last_iterate() {
        // starts next to the optimum; the oversized step overshoots and never recovers in 3 iterations
        let view = plane_view(4, 4, 2.0, [0.5, 0.5, 0.5]);
        let mut renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
        let store = populated_store();
        let mut p = params(3);
        p.lrs.cam_trans = 0.5;
        let estimator = PoseEstimator::new(p);

        let initial = CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, 0.01));
        let outcome = estimator.estimate(&mut renderer, &store, &view, initial).unwrap();
        assert!((outcome.pose.translation().z - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_depth_threshold_extends_once() {
        let view = plane_view(4, 4, 2.0, [0.5, 0.5, 0.5]);
        let mut renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
        let store = populated_store();
        let mut p = params(5);
        p.lrs.cam_trans = 0.0;
        p.use_depth_loss_thres = true;
        p.depth_loss_thres = 1e-3;
        let estimator = PoseEstimator::new(p);

        let initial = CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, 1.0));
        let outcome = estimator.estimate(&mut renderer, &store, &view, initial).unwrap();
        assert!(outcome.extended);
        assert_eq!(outcome.iterations, 10);
    }

    #[test]
    fn test_zero_budget_returns_initial() {
        let view = plane_view(4, 4, 2.0, [0.5, 0.5, 0.5]);
        let mut renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
        let estimator = PoseEstimator::new(params(0));
        let initial = CameraPose::new(Quat::IDENTITY, Vec3::X);
        let outcome = estimator
            .estimate(&mut renderer, &PrimitiveStore::new(), &view, initial)
            .unwrap();
        assert_eq!(outcome.pose, initial);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(renderer.render_calls(), 0);
    }

    #[test]
    fn test_renderer_failure_propagates() {
        let view = plane_view(4, 4, 2.0, [0.5, 0.5, 0.5]);
        let mut renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
        renderer.fail_after(0);
        let estimator = PoseEstimator::new(params(3));
        let result = estimator.estimate(&mut renderer, &populated_store(), &view, CameraPose::identity());
        assert!(matches!(result, Err(RenderError::Backend(_))));
    }

    #[test]
    fn test_initial_pose_modes() {
        let mut trajectory = Trajectory::new();
        let estimator = PoseEstimator::new(params(1));
        assert_eq!(estimator.initial_pose(&trajectory, 0), CameraPose::identity());

        trajectory.insert(0, CameraPose::identity());
        trajectory.insert(1, CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, -0.1)));
        let forward = estimator.initial_pose(&trajectory, 2);
        assert!((forward.translation() - Vec3::new(0.0, 0.0, -0.2)).length() < 1e-6);

        // rotating motion: the translation follows the rotated delta
        let mut turning = Trajectory::new();
        turning.insert(0, CameraPose::identity());
        let step = CameraPose::new(Quat::from_rotation_y(0.5), Vec3::new(1.0, 0.0, 0.0));
        turning.insert(1, step);
        let predicted = estimator.initial_pose(&turning, 2);
        let expected = step.compose(&step);
        assert!((predicted.translation() - expected.translation()).length() < 1e-5);
        assert!((predicted.translation() - Vec3::new(1.0 + 0.5f32.cos(), 0.0, -0.5f32.sin())).length() < 1e-5);
        assert!(predicted.rotation_angle_to(&CameraPose::new(Quat::from_rotation_y(1.0), Vec3::ZERO)) < 0.1);

        let copy = PoseEstimator::new(TrackingParams { forward_prop: false, ..params(1) });
        let copied = copy.initial_pose(&trajectory, 2);
        assert!((copied.translation() - Vec3::new(0.0, 0.0, -0.1)).length() < 1e-6);
    }
}
