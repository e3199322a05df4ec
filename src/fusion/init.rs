//! Primitive initialization from depth observations.
//!
//! New primitives are unprojected from masked depth pixels into world space.
//! Their initial size comes either from the pixel footprint at the observed
//! depth or from the distance to the nearest neighbouring point.

use glam::Vec3;
use kiddo::{ImmutableKdTree, SquaredEuclidean};

use crate::config::ScaleInitMethod;
use crate::core::{CameraPose, RgbdView};

use super::primitive::Primitive;

/// Opacity of freshly created primitives (logit 0)
pub const INITIAL_OPACITY: f32 = 0.5;

/// One unprojected depth sample
#[derive(Debug, Clone, Copy)]
pub struct PointSample {
    pub position: Vec3,
    pub color: Vec3,
    /// Observed camera depth
    pub depth: f32,
}

/// Limits for nearest-neighbour scale estimation
#[derive(Debug, Clone, Copy)]
pub struct NeighborScaleLimits {
    pub min_scale: f32,
    pub max_scale: f32,
    pub scale_factor: f32,
}

impl Default for NeighborScaleLimits {
    fn default() -> Self {
        Self {
            min_scale: 0.001,
            max_scale: 0.2,
            scale_factor: 0.5,
        }
    }
}

/// Unproject every pixel with valid depth (and `mask[i]` when given) to world space.
///
/// `w2c` is the world-to-camera pose of the view.
pub fn unproject_view(view: &RgbdView, w2c: &CameraPose, mask: Option<&[bool]>) -> Vec<PointSample> {
    let c2w = w2c.inverse();
    let width = view.camera.width as usize;
    let mut points = Vec::new();

    for (i, &depth) in view.depth.data.iter().enumerate() {
        if !(depth.is_finite() && depth > 0.0) {
            continue;
        }
        if let Some(mask) = mask {
            if !mask.get(i).copied().unwrap_or(false) {
                continue;
            }
        }
        let u = (i % width) as f32;
        let v = (i / width) as f32;
        let local = view.camera.unproject(u, v, depth);
        points.push(PointSample {
            position: c2w.transform_point(local),
            color: view.color.pixel(i),
            depth,
        });
    }

    points
}

/// Initial world scale for each point
pub fn initial_scales(
    points: &[PointSample],
    mean_focal: f32,
    method: ScaleInitMethod,
    limits: &NeighborScaleLimits,
) -> Vec<f32> {
    match method {
        ScaleInitMethod::Projective => points
            .iter()
            .map(|p| (p.depth / mean_focal).max(f32::MIN_POSITIVE))
            .collect(),
        ScaleInitMethod::NearestNeighbor => nearest_neighbor_scales(points, limits),
    }
}

fn nearest_neighbor_scales(points: &[PointSample], limits: &NeighborScaleLimits) -> Vec<f32> {
    if points.len() <= 1 {
        return vec![limits.min_scale; points.len()];
    }

    // bulk construction copes with many points sharing a coordinate (flat walls)
    let positions: Vec<[f32; 3]> = points.iter().map(|p| p.position.to_array()).collect();
    let tree: ImmutableKdTree<f32, 3> = ImmutableKdTree::new_from_slice(&positions);

    points
        .iter()
        .enumerate()
        .map(|(idx, p)| {
            let neighbors = tree.nearest_n::<SquaredEuclidean>(&p.position.to_array(), std::num::NonZeroUsize::new(2).unwrap());
            let nearest = neighbors
                .iter()
                .find(|n| n.item as usize != idx)
                .map(|n| n.distance.sqrt())
                .unwrap_or(limits.min_scale);
            (nearest * limits.scale_factor).clamp(limits.min_scale, limits.max_scale)
        })
        .collect()
}

/// Build primitives from samples and their scales
pub fn primitives_from_points(points: &[PointSample], scales: &[f32]) -> Vec<Primitive> {
    points
        .iter()
        .zip(scales)
        .map(|(p, s)| Primitive::new(p.position, p.color, *s, INITIAL_OPACITY))
        .collect()
}

/// Scene radius used by the size caps: max observed depth over the ratio
pub fn scene_radius(view: &RgbdView, depth_ratio: f32) -> f32 {
    view.depth.max_depth() / depth_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Camera, ColorImage, DepthImage};
    use glam::Quat;

    fn plane_view(depth: f32) -> RgbdView {
        let camera = Camera::new(2.0, 2.0, 1.0, 1.0, 2, 2);
        RgbdView::new(
            ColorImage::filled(2, 2, [0.2, 0.4, 0.6]),
            DepthImage::new(2, 2, vec![depth, depth, 0.0, depth]),
            camera,
        )
    }

    #[test]
    fn test_unproject_skips_invalid_and_masked() {
        let view = plane_view(2.0);
        let all = unproject_view(&view, &CameraPose::identity(), None);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| (p.position.z - 2.0).abs() < 1e-6));

        let mask = [true, false, true, false];
        let some = unproject_view(&view, &CameraPose::identity(), Some(&mask));
        assert_eq!(some.len(), 1);
    }

    #[test]
    fn test_unproject_uses_camera_to_world() {
        let view = plane_view(1.0);
        // camera sits at world z = -1
        let w2c = CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, 1.0));
        let points = unproject_view(&view, &w2c, None);
        assert!(points.iter().all(|p| p.position.z.abs() < 1e-6));
    }

    #[test]
    fn test_projective_scale() {
        let view = plane_view(4.0);
        let points = unproject_view(&view, &CameraPose::identity(), None);
        let scales = initial_scales(&points, 2.0, ScaleInitMethod::Projective, &NeighborScaleLimits::default());
        assert!(scales.iter().all(|s| (*s - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_nearest_neighbor_scale() {
        let points = vec![
            PointSample { position: Vec3::ZERO, color: Vec3::ONE, depth: 1.0 },
            PointSample { position: Vec3::new(0.2, 0.0, 0.0), color: Vec3::ONE, depth: 1.0 },
        ];
        let limits = NeighborScaleLimits { min_scale: 0.01, max_scale: 1.0, scale_factor: 0.5 };
        let scales = initial_scales(&points, 1.0, ScaleInitMethod::NearestNeighbor, &limits);
        assert!(scales.iter().all(|s| (*s - 0.1).abs() < 1e-5));
    }

    #[test]
    fn test_nearest_neighbor_scale_on_flat_wall() {
        let view = crate::test_utils::plane_view(64, 48, 2.0, [0.5; 3]);
        let points = unproject_view(&view, &CameraPose::identity(), None);
        assert_eq!(points.len(), 64 * 48);

        let limits = NeighborScaleLimits::default();
        let scales = initial_scales(&points, 32.0, ScaleInitMethod::NearestNeighbor, &limits);
        assert_eq!(scales.len(), points.len());
        assert!(scales.iter().all(|s| *s >= limits.min_scale && *s <= limits.max_scale));
    }

    #[test]
    fn test_scene_radius() {
        assert!((scene_radius(&plane_view(3.0), 3.0) - 1.0).abs() < 1e-6);
    }
}
