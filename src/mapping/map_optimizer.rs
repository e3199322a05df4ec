//! Map refinement over a working set of views

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{GaussianDistribution, LifecycleClock, MappingParams};
use crate::core::{CameraPose, RgbdView};
use crate::fusion::{
    compute_loss, LossSettings, PrimitiveOptimizer, PrimitiveStore, Reduction, RenderError, Renderer,
};

use super::keyframes::{KeyframeManager, WorkingEntry};
use super::lifecycle::{LifecycleReport, PrimitiveLifecycleManager};

/// A view sampled during mapping, with its fixed pose
#[derive(Debug, Clone, Copy)]
pub struct MappingTarget<'a> {
    pub frame_index: usize,
    pub view: &'a RgbdView,
    pub pose: CameraPose,
}

/// Resolve a working set into views, the live frame supplied by the caller.
pub fn resolve_working_set<'a>(
    keyframes: &'a KeyframeManager,
    entries: &[WorkingEntry],
    live: MappingTarget<'a>,
) -> Vec<MappingTarget<'a>> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            WorkingEntry::Live => Some(live),
            WorkingEntry::Keyframe(i) => keyframes.keyframes().get(*i).map(|kf| MappingTarget {
                frame_index: kf.frame_index,
                view: &kf.view,
                pose: kf.pose,
            }),
        })
        .collect()
}

/// Result of one mapping pass
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingOutcome {
    pub iterations: usize,
    /// Loss of the last iteration
    pub final_loss: f32,
    pub lifecycle: LifecycleReport,
}

/// Optimizes primitive parameters with poses held fixed.
#[derive(Debug, Clone)]
pub struct MapOptimizer {
    params: MappingParams,
    optimizer: PrimitiveOptimizer,
    lifecycle: PrimitiveLifecycleManager,
    rng: StdRng,
}

impl MapOptimizer {
    pub fn new(
        params: MappingParams,
        distribution: GaussianDistribution,
        clock: LifecycleClock,
        scene_radius: f32,
        seed: u64,
    ) -> Self {
        let optimizer = PrimitiveOptimizer::new(&params.lrs, distribution);
        let lifecycle = PrimitiveLifecycleManager::new(&params, clock, scene_radius);
        Self {
            params,
            optimizer,
            lifecycle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &MappingParams {
        &self.params
    }

    pub fn optimizer(&self) -> &PrimitiveOptimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut PrimitiveOptimizer {
        &mut self.optimizer
    }

    pub fn lifecycle(&self) -> &PrimitiveLifecycleManager {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut PrimitiveLifecycleManager {
        &mut self.lifecycle
    }

    /// Mapping loss: mean over the mask, color over every pixel
    pub fn loss_settings(&self) -> LossSettings {
        LossSettings {
            use_l1: self.params.use_l1,
            use_sil_for_loss: self.params.use_sil_for_loss,
            sil_thres: self.params.sil_thres,
            ignore_outlier_depth_loss: self.params.ignore_outlier_depth_loss,
            weights: self.params.loss_weights,
            reduction: Reduction::Mean,
            mask_color: false,
        }
    }

    /// Run `num_iters` iterations, each on a view drawn uniformly from `targets`.
    ///
    /// An empty working set is a no-op.
    pub fn optimize<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
        store: &mut PrimitiveStore,
        targets: &[MappingTarget<'_>],
        frame_index: usize,
    ) -> Result<MappingOutcome, RenderError> {
        let mut outcome = MappingOutcome::default();
        if targets.is_empty() || self.params.num_iters == 0 {
            return Ok(outcome);
        }
        if self.params.reset_optimizer_each_frame {
            self.optimizer.reset(store);
        }

        let settings = self.loss_settings();
        for iter in 0..self.params.num_iters {
            let target = &targets[self.rng.gen_range(0..targets.len())];
            let output = renderer.render(store, &target.pose, &target.view.camera)?;
            let loss = compute_loss(&output, target.view, &settings)?;
            let grads = renderer.backward(store, &target.pose, &target.view.camera, &output, &loss.grads)?;
            store.set_gradients(&grads.primitives)?;

            let report = self.lifecycle.apply(store, iter as u64, frame_index, &mut self.rng);
            outcome.lifecycle.merge(&report);

            self.optimizer.step(store);
            store.zero_grad();

            outcome.iterations += 1;
            outcome.final_loss = loss.total;
        }

        debug!(
            "frame {}: mapped {} iterations over {} views, loss {:.5}, {} primitives",
            frame_index,
            outcome.iterations,
            targets.len(),
            outcome.final_loss,
            store.len()
        );
        Ok(outcome)
    }
}
