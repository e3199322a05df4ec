//! Primitive lifecycle: pruning, densification and opacity reset.
//!
//! Both schedules are evaluated against a single iteration counter. Pruning
//! and densification events happen only inside their `[start_after,
//! stop_after]` windows; the densification statistics accumulate on every
//! iteration up to `stop_after`.

use std::f32::consts::PI;

use glam::Vec3;
use log::debug;
use rand::Rng;

use crate::config::{DensifySchedule, LifecycleClock, MappingParams, PruneSchedule};
use crate::fusion::primitive::{layout, opacity_to_logit};
use crate::fusion::{PrimitiveHandle, PrimitiveStore};

/// What one lifecycle invocation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    /// Removed by the pruning schedule
    pub pruned: usize,
    pub cloned: usize,
    /// Parents split (each replaced by `num_to_split_into` children)
    pub split: usize,
    /// Removed after a densify event
    pub densify_removed: usize,
    /// Opacity resets applied
    pub opacity_resets: usize,
}

impl LifecycleReport {
    pub fn merge(&mut self, other: &LifecycleReport) {
        self.pruned += other.pruned;
        self.cloned += other.cloned;
        self.split += other.split;
        self.densify_removed += other.densify_removed;
        self.opacity_resets += other.opacity_resets;
    }

    pub fn is_empty(&self) -> bool {
        *self == LifecycleReport::default()
    }
}

/// Whether `iter` lies inside `[start, stop]`
pub fn in_window(iter: u64, start: u64, stop: u64) -> bool {
    iter >= start && iter <= stop
}

/// Linear interpolation from `initial` at `start` to `final_value` at `stop`
pub fn interpolated_threshold(initial: f32, final_value: f32, start: u64, stop: u64, iter: u64) -> f32 {
    if stop <= start {
        return final_value;
    }
    let t = (iter.saturating_sub(start) as f32 / (stop - start) as f32).clamp(0.0, 1.0);
    initial + (final_value - initial) * t
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Set every opacity to `value` and drop the opacity moments
fn reset_opacities(store: &mut PrimitiveStore, value: f32) {
    let logit = opacity_to_logit(value);
    for entry in store.entries_mut() {
        entry.primitive.logit_opacity = logit;
        entry.state.moment1[layout::OPACITY] = 0.0;
        entry.state.moment2[layout::OPACITY] = 0.0;
    }
}

/// Removes transparent and oversized primitives: `opacity < threshold`, or
/// `max_scale > big_cap` when `big_cap` is given.
fn remove_weak(store: &mut PrimitiveStore, threshold: f32, big_cap: Option<f32>) -> usize {
    store.retain(|e| {
        let transparent = e.primitive.opacity() < threshold;
        let oversized = big_cap.map_or(false, |cap| e.primitive.max_scale() > cap);
        !(transparent || oversized)
    })
}

/// Applies the pruning and densification schedules to the map.
#[derive(Debug, Clone)]
pub struct PrimitiveLifecycleManager {
    pruning: PruneSchedule,
    densify: DensifySchedule,
    prune_enabled: bool,
    densify_enabled: bool,
    clock: LifecycleClock,
    global_iteration: u64,
    scene_radius: f32,
}

impl PrimitiveLifecycleManager {
    pub fn new(params: &MappingParams, clock: LifecycleClock, scene_radius: f32) -> Self {
        Self {
            pruning: params.pruning.clone(),
            densify: params.densify.clone(),
            prune_enabled: params.prune_gaussians,
            densify_enabled: params.use_gaussian_splatting_densification,
            clock,
            global_iteration: 0,
            scene_radius,
        }
    }

    pub fn scene_radius(&self) -> f32 {
        self.scene_radius
    }

    pub fn set_scene_radius(&mut self, radius: f32) {
        self.scene_radius = radius;
    }

    /// Mapping iterations run over the whole session
    pub fn global_iteration(&self) -> u64 {
        self.global_iteration
    }

    pub fn set_global_iteration(&mut self, iteration: u64) {
        self.global_iteration = iteration;
    }

    /// Schedule counter for the given per-frame mapping iteration
    pub fn counter(&self, local_iteration: u64) -> u64 {
        match self.clock {
            LifecycleClock::PerFrame => local_iteration,
            LifecycleClock::Global => self.global_iteration,
        }
    }

    /// Run pruning, then densification, for one mapping iteration.
    ///
    /// Expects the current gradients to be loaded in the store. Newly created
    /// primitives carry zero gradient and zero optimizer state.
    pub fn apply<R: Rng + ?Sized>(
        &mut self,
        store: &mut PrimitiveStore,
        local_iteration: u64,
        frame_index: usize,
        rng: &mut R,
    ) -> LifecycleReport {
        let iter = self.counter(local_iteration);
        let mut report = LifecycleReport::default();
        if self.prune_enabled {
            report.merge(&self.prune(store, iter));
        }
        if self.densify_enabled {
            report.merge(&self.densify(store, iter, frame_index, rng));
        }
        self.global_iteration += 1;
        report
    }

    /// Size cap for oversized removal; none until the scene radius is known
    fn big_cap(&self, iter: u64, remove_big_after: u64, ratio: f32) -> Option<f32> {
        (iter >= remove_big_after && self.scene_radius > 0.0).then(|| ratio * self.scene_radius)
    }

    /// Pruning schedule at counter value `iter`
    pub fn prune(&self, store: &mut PrimitiveStore, iter: u64) -> LifecycleReport {
        let s = &self.pruning;
        let mut report = LifecycleReport::default();
        if iter > s.stop_after {
            return report;
        }

        if iter >= s.start_after && iter % s.prune_every == 0 {
            let threshold = interpolated_threshold(
                s.removal_opacity_threshold,
                s.final_removal_opacity_threshold,
                s.start_after,
                s.stop_after,
                iter,
            );
            let big_cap = self.big_cap(iter, s.remove_big_after, s.big_scale_ratio);
            report.pruned = remove_weak(store, threshold, big_cap);
            if report.pruned > 0 {
                debug!("pruned {} primitives at iteration {} (opacity < {:.3})", report.pruned, iter, threshold);
            }
        }

        if s.reset_opacities && iter > 0 && iter % s.reset_opacities_every == 0 {
            reset_opacities(store, s.reset_opacity_value);
            report.opacity_resets += 1;
        }
        report
    }

    /// Densification schedule at counter value `iter`
    pub fn densify<R: Rng + ?Sized>(
        &self,
        store: &mut PrimitiveStore,
        iter: u64,
        frame_index: usize,
        rng: &mut R,
    ) -> LifecycleReport {
        let s = &self.densify;
        let mut report = LifecycleReport::default();
        if iter > s.stop_after {
            return report;
        }

        for entry in store.entries_mut() {
            if entry.state.visible {
                let [gx, gy] = entry.state.screen_grad;
                entry.state.grad_accum += (gx * gx + gy * gy).sqrt();
                entry.state.denom += 1.0;
            }
        }

        if iter >= s.start_after && iter % s.densify_every == 0 {
            let split_cap = s.split_scale_ratio * self.scene_radius;
            let mut to_clone: Vec<PrimitiveHandle> = Vec::new();
            let mut to_split: Vec<PrimitiveHandle> = Vec::new();
            for entry in store.entries() {
                if entry.state.mean_screen_grad() < s.grad_thresh {
                    continue;
                }
                if entry.primitive.max_scale() <= split_cap {
                    to_clone.push(entry.handle);
                } else {
                    to_split.push(entry.handle);
                }
            }

            for handle in &to_clone {
                if let Some(primitive) = store.get(*handle).copied() {
                    store.push(primitive, frame_index);
                }
            }

            let n = s.num_to_split_into;
            for handle in &to_split {
                let Some(parent) = store.get(*handle).copied() else {
                    continue;
                };
                let scales = parent.scales();
                let rotation = parent.rotation();
                let child_log_scales = (scales / (0.8 * n as f32)).max(Vec3::splat(f32::MIN_POSITIVE));
                for _ in 0..n {
                    let offset = Vec3::new(
                        standard_normal(rng) * scales.x,
                        standard_normal(rng) * scales.y,
                        standard_normal(rng) * scales.z,
                    );
                    let mut child = parent;
                    child.position = parent.position + rotation * offset;
                    child.log_scales = Vec3::new(
                        child_log_scales.x.ln(),
                        child_log_scales.y.ln(),
                        child_log_scales.z.ln(),
                    );
                    store.push(child, frame_index);
                }
            }
            store.remove(&to_split);
            store.reset_densify_stats();

            report.cloned = to_clone.len();
            report.split = to_split.len();

            let threshold = interpolated_threshold(
                s.removal_opacity_threshold,
                s.final_removal_opacity_threshold,
                s.start_after,
                s.stop_after,
                iter,
            );
            let big_cap = self.big_cap(iter, s.remove_big_after, s.big_scale_ratio);
            report.densify_removed = remove_weak(store, threshold, big_cap);

            debug!(
                "densify at iteration {}: {} cloned, {} split, {} removed, {} remain",
                iter,
                report.cloned,
                report.split,
                report.densify_removed,
                store.len()
            );
        }

        if s.reset_opacities && iter > 0 && iter % s.reset_opacities_every == 0 {
            reset_opacities(store, s.reset_opacity_value);
            report.opacity_resets += 1;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{Primitive, PrimitiveGrad};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params() -> MappingParams {
        MappingParams {
            prune_gaussians: true,
            use_gaussian_splatting_densification: true,
            pruning: PruneSchedule {
                start_after: 10,
                remove_big_after: 1000,
                stop_after: 20,
                prune_every: 5,
                removal_opacity_threshold: 0.1,
                final_removal_opacity_threshold: 0.3,
                reset_opacities: false,
                ..Default::default()
            },
            densify: DensifySchedule {
                start_after: 10,
                remove_big_after: 1000,
                stop_after: 20,
                densify_every: 10,
                grad_thresh: 0.5,
                num_to_split_into: 2,
                split_scale_ratio: 0.1,
                removal_opacity_threshold: 0.01,
                final_removal_opacity_threshold: 0.01,
                reset_opacities: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn manager() -> PrimitiveLifecycleManager {
        PrimitiveLifecycleManager::new(&params(), LifecycleClock::PerFrame, 1.0)
    }

    fn prim(opacity: f32, scale: f32) -> Primitive {
        Primitive::new(Vec3::new(0.0, 0.0, 2.0), Vec3::splat(0.5), scale, opacity)
    }

    fn load_screen_grads(store: &mut PrimitiveStore, grad: [f32; 2]) {
        let grads = vec![PrimitiveGrad { screen: grad, visible: true, ..Default::default() }; store.len()];
        store.set_gradients(&grads).unwrap();
    }

    #[test]
    fn test_interpolated_threshold() {
        assert_eq!(interpolated_threshold(0.1, 0.3, 10, 20, 5), 0.1);
        assert!((interpolated_threshold(0.1, 0.3, 10, 20, 15) - 0.2).abs() < 1e-6);
        assert_eq!(interpolated_threshold(0.1, 0.3, 10, 20, 30), 0.3);
        assert_eq!(interpolated_threshold(0.1, 0.3, 10, 10, 10), 0.3);
    }

    #[test]
    fn test_prune_removes_low_opacity_inside_window_only() {
        let m = manager();
        let mut store = PrimitiveStore::new();
        let weak = store.push(prim(0.05, 0.01), 0);
        let strong = store.push(prim(0.9, 0.01), 0);

        assert_eq!(m.prune(&mut store, 5).pruned, 0);
        assert_eq!(m.prune(&mut store, 25).pruned, 0);
        assert_eq!(m.prune(&mut store, 12).pruned, 0); // not a multiple of prune_every
        assert_eq!(store.len(), 2);

        let report = m.prune(&mut store, 10);
        assert_eq!(report.pruned, 1);
        assert!(store.get(weak).is_none());
        assert!(store.get(strong).is_some());
    }

    #[test]
    fn test_prune_threshold_tightens_over_window() {
        let m = manager();
        let mut store = PrimitiveStore::new();
        store.push(prim(0.2, 0.01), 0);
        assert_eq!(m.prune(&mut store, 10).pruned, 0);
        assert_eq!(m.prune(&mut store, 20).pruned, 1);
    }

    #[test]
    fn test_prune_removes_big_after_threshold() {
        let mut p = params();
        p.pruning.remove_big_after = 15;
        let m = PrimitiveLifecycleManager::new(&p, LifecycleClock::PerFrame, 1.0);
        let mut store = PrimitiveStore::new();
        store.push(prim(0.9, 0.5), 0);

        assert_eq!(m.prune(&mut store, 10).pruned, 0);
        assert_eq!(m.prune(&mut store, 15).pruned, 1);
    }

    #[test]
    fn test_big_removal_waits_for_scene_radius() {
        let mut p = params();
        p.pruning.remove_big_after = 0;
        let mut m = PrimitiveLifecycleManager::new(&p, LifecycleClock::PerFrame, 0.0);
        let mut store = PrimitiveStore::new();
        store.push(prim(0.9, 0.5), 0);

        assert_eq!(m.prune(&mut store, 10).pruned, 0);
        m.set_scene_radius(1.0);
        assert_eq!(m.prune(&mut store, 15).pruned, 1);
    }

    #[test]
    fn test_densify_clones_small_high_gradient_primitive() {
        let m = manager();
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = PrimitiveStore::new();
        let original = store.push(prim(0.9, 0.01), 0);
        store.push(prim(0.9, 0.01), 0);
        store.state_mut(original).unwrap().moment1 = [1.0; crate::fusion::PARAM_DIM];

        let grads = vec![
            PrimitiveGrad { screen: [0.6, 0.8], visible: true, ..Default::default() },
            PrimitiveGrad { screen: [0.1, 0.0], visible: true, ..Default::default() },
        ];
        store.set_gradients(&grads).unwrap();

        let report = m.densify(&mut store, 10, 3, &mut rng);
        assert_eq!(report.cloned, 1);
        assert_eq!(report.split, 0);
        assert_eq!(store.len(), 3);

        let clone = &store.entries()[2];
        assert_eq!(clone.primitive, *store.get(original).unwrap());
        assert_eq!(clone.birth_frame, 3);
        assert_eq!(clone.state.moment1, [0.0; crate::fusion::PARAM_DIM]);
        assert!(store.entries().iter().all(|e| e.state.denom == 0.0));
    }

    #[test]
    fn test_densify_splits_large_primitive() {
        let m = manager();
        let mut rng = StdRng::seed_from_u64(7);
        let mut store = PrimitiveStore::new();
        let parent = store.push(prim(0.9, 0.4), 0);
        load_screen_grads(&mut store, [1.0, 0.0]);

        let report = m.densify(&mut store, 10, 1, &mut rng);
        assert_eq!(report.split, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(parent).is_none());
        for child in store.primitives() {
            assert!((child.max_scale() - 0.4 / 1.6).abs() < 1e-5);
            assert!((child.opacity() - 0.9).abs() < 1e-5);
        }
    }

    #[test]
    fn test_densify_event_removes_oversized_primitives() {
        let mut p = params();
        p.densify.remove_big_after = 10;
        p.densify.big_scale_ratio = 0.1;
        let m = PrimitiveLifecycleManager::new(&p, LifecycleClock::PerFrame, 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut store = PrimitiveStore::new();
        let small = store.push(prim(0.9, 0.05), 0);
        let big_quiet = store.push(prim(0.9, 0.5), 0);
        let big_busy = store.push(prim(0.9, 0.4), 0);
        let grads = vec![
            PrimitiveGrad { screen: [1.0, 0.0], visible: true, ..Default::default() },
            PrimitiveGrad { screen: [0.0, 0.0], visible: true, ..Default::default() },
            PrimitiveGrad { screen: [1.0, 0.0], visible: true, ..Default::default() },
        ];
        store.set_gradients(&grads).unwrap();

        let report = m.densify(&mut store, 10, 2, &mut rng);
        assert_eq!(report.cloned, 1);
        assert_eq!(report.split, 1);
        // the quiet big primitive and both split children (scale 0.25) exceed the cap
        assert_eq!(report.densify_removed, 3);
        assert_eq!(store.len(), 2);
        assert!(store.get(small).is_some());
        assert!(store.get(big_quiet).is_none());
        assert!(store.get(big_busy).is_none());
        assert!(store.primitives().all(|p| p.max_scale() <= 0.1));
    }

    #[test]
    fn test_densify_schedule_resets_opacity() {
        let mut p = params();
        p.densify.reset_opacities = true;
        p.densify.reset_opacities_every = 4;
        let m = PrimitiveLifecycleManager::new(&p, LifecycleClock::PerFrame, 1.0);
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = PrimitiveStore::new();
        let h = store.push(prim(0.9, 0.01), 0);
        store.state_mut(h).unwrap().moment1[layout::OPACITY] = 0.5;
        store.state_mut(h).unwrap().moment2[layout::OPACITY] = 0.25;

        assert_eq!(m.densify(&mut store, 0, 0, &mut rng).opacity_resets, 0);
        assert_eq!(m.densify(&mut store, 6, 0, &mut rng).opacity_resets, 0);
        assert!((store.get(h).unwrap().opacity() - 0.9).abs() < 1e-5);

        assert_eq!(m.densify(&mut store, 8, 0, &mut rng).opacity_resets, 1);
        assert!((store.get(h).unwrap().opacity() - 0.01).abs() < 1e-5);
        let state = store.state(h).unwrap();
        assert_eq!(state.moment1[layout::OPACITY], 0.0);
        assert_eq!(state.moment2[layout::OPACITY], 0.0);

        // past stop_after the schedule is inert
        store.get_mut(h).unwrap().set_opacity(0.9);
        assert_eq!(m.densify(&mut store, 24, 0, &mut rng).opacity_resets, 0);
        assert!((store.get(h).unwrap().opacity() - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_densify_accumulates_outside_event_and_stops_after_window() {
        let m = manager();
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = PrimitiveStore::new();
        let h = store.push(prim(0.9, 0.01), 0);
        load_screen_grads(&mut store, [0.3, 0.4]);

        m.densify(&mut store, 3, 0, &mut rng);
        assert_eq!(store.state(h).unwrap().denom, 1.0);
        m.densify(&mut store, 21, 0, &mut rng);
        assert_eq!(store.state(h).unwrap().denom, 1.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_opacity_reset_schedule() {
        let mut p = params();
        p.pruning.reset_opacities = true;
        p.pruning.reset_opacities_every = 4;
        p.pruning.removal_opacity_threshold = 0.0;
        p.pruning.final_removal_opacity_threshold = 0.0;
        let m = PrimitiveLifecycleManager::new(&p, LifecycleClock::PerFrame, 1.0);
        let mut store = PrimitiveStore::new();
        let h = store.push(prim(0.9, 0.01), 0);

        assert_eq!(m.prune(&mut store, 0).opacity_resets, 0);
        assert_eq!(m.prune(&mut store, 8).opacity_resets, 1);
        assert!((store.get(h).unwrap().opacity() - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_empty_store_is_valid() {
        let mut m = manager();
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = PrimitiveStore::new();
        let report = m.apply(&mut store, 10, 0, &mut rng);
        assert!(report.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_global_clock_counts_across_calls() {
        let mut m = PrimitiveLifecycleManager::new(&params(), LifecycleClock::Global, 1.0);
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = PrimitiveStore::new();
        for _ in 0..5 {
            m.apply(&mut store, 0, 0, &mut rng);
        }
        assert_eq!(m.global_iteration(), 5);
        assert_eq!(m.counter(0), 5);
    }
}
