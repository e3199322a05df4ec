use glam::Vec3;

use rustsplat::config::{GaussianDistribution, LifecycleClock, MappingParams};
use rustsplat::core::CameraPose;
use rustsplat::fusion::{Primitive, PrimitiveStore};
use rustsplat::mapping::{MapOptimizer, MappingTarget};
use rustsplat::test_utils::{plane_view, PlaneRenderer};

fn mapping(num_iters: usize) -> MappingParams {
    let mut params = MappingParams {
        num_iters,
        ..Default::default()
    };
    params.pruning.start_after = 0;
    params.pruning.stop_after = 10;
    params.pruning.prune_every = 1;
    params.pruning.remove_big_after = 1000;
    params
}

fn primitive(x: f32, scale: f32, opacity: f32) -> Primitive {
    Primitive::new(Vec3::new(x, 0.0, 2.0), Vec3::splat(0.5), scale, opacity)
}

#[test]
fn low_opacity_primitive_is_pruned_in_window() {
    let view = plane_view(8, 6, 2.0, [0.5; 3]);
    let mut store = PrimitiveStore::new();
    let faint = store.push(primitive(0.0, 0.001, 0.001), 0);
    let solid = store.push(primitive(0.1, 0.001, 0.9), 0);

    let mut mapper = MapOptimizer::new(mapping(1), GaussianDistribution::Isotropic, LifecycleClock::PerFrame, 1.0, 0);
    let mut renderer = PlaneRenderer::new(2.0, [0.5; 3]);
    let live = MappingTarget { frame_index: 0, view: &view, pose: CameraPose::identity() };
    let outcome = mapper.optimize(&mut renderer, &mut store, &[live], 0).unwrap();

    assert_eq!(outcome.lifecycle.pruned, 1);
    assert!(store.get(faint).is_none());
    assert!(store.get(solid).is_some());
    for p in store.primitives() {
        assert!(p.opacity() > 0.0 && p.opacity() < 1.0);
        assert!(p.scales().min_element() > 0.0);
    }
}

#[test]
fn no_lifecycle_events_outside_windows() {
    let view = plane_view(8, 6, 2.0, [0.5; 3]);
    let mut store = PrimitiveStore::new();
    store.push(primitive(0.0, 0.001, 0.001), 0);

    let mut params = mapping(5);
    params.pruning.start_after = 50;
    params.pruning.stop_after = 60;
    params.use_gaussian_splatting_densification = true;
    params.densify.start_after = 50;
    params.densify.stop_after = 60;
    params.densify.densify_every = 1;
    params.densify.grad_thresh = 0.0;

    let mut mapper = MapOptimizer::new(params, GaussianDistribution::Isotropic, LifecycleClock::PerFrame, 1.0, 0);
    let mut renderer = PlaneRenderer::new(2.0, [0.5; 3]).with_screen_grad([1.0, 1.0]);
    let live = MappingTarget { frame_index: 0, view: &view, pose: CameraPose::identity() };
    let outcome = mapper.optimize(&mut renderer, &mut store, &[live], 0).unwrap();

    assert!(outcome.lifecycle.is_empty());
    assert_eq!(store.len(), 1);
}

#[test]
fn high_gradient_small_primitive_is_cloned_once() {
    let view = plane_view(8, 6, 2.0, [0.5; 3]);
    let mut store = PrimitiveStore::new();
    store.push(primitive(0.0, 0.001, 0.9), 0);

    let mut params = mapping(1);
    params.use_gaussian_splatting_densification = true;
    params.densify.start_after = 0;
    params.densify.stop_after = 10;
    params.densify.densify_every = 1;
    params.densify.grad_thresh = 0.5;

    let mut mapper = MapOptimizer::new(params, GaussianDistribution::Isotropic, LifecycleClock::PerFrame, 1.0, 0);
    let mut renderer = PlaneRenderer::new(2.0, [0.5; 3]).with_screen_grad([0.6, 0.8]);
    let live = MappingTarget { frame_index: 3, view: &view, pose: CameraPose::identity() };
    let outcome = mapper.optimize(&mut renderer, &mut store, &[live], 3).unwrap();

    assert_eq!(outcome.lifecycle.cloned, 1);
    assert_eq!(outcome.lifecycle.split, 0);
    assert_eq!(store.len(), 2);
    assert_eq!(store.entries()[1].birth_frame, 3);
}
