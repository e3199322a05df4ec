//! Test utilities for RustSplat
//!
//! This module provides synthetic fixtures with closed-form behaviour:
//! - a fronto-parallel plane renderer with exact translation gradients
//! - flat-plane RGB-D views
//! - in-memory datasets with optional ground truth and injected load failures
//!
//! # Examples
//!
//! ```
//! use rustsplat::test_utils::*;
//!
//! let dataset = SyntheticDataset::plane_sequence(3, 16, 12, 2.0, None);
//! let renderer = PlaneRenderer::new(2.0, [0.5, 0.5, 0.5]);
//! assert_eq!(renderer.render_calls(), 0);
//! # let _ = dataset;
//! ```

use glam::{Mat4, Vec3};

use crate::core::{Camera, CameraPose, ColorImage, DepthImage, RgbdFrame, RgbdView};
use crate::fusion::primitive::layout;
use crate::fusion::{
    Gradients, ImageGradients, PoseGrad, PrimitiveGrad, PrimitiveStore, RenderError, RenderOutput,
    Renderer,
};
use crate::io::{Dataset, DatasetError};

/// Intrinsics used by every synthetic view: 90 degree field of view
pub fn synthetic_camera(width: u32, height: u32) -> Camera {
    Camera::new(
        width as f32 / 2.0,
        width as f32 / 2.0,
        width as f32 / 2.0,
        height as f32 / 2.0,
        width,
        height,
    )
}

/// A view of a flat wall at constant `depth` with uniform `color`
pub fn plane_view(width: u32, height: u32, depth: f32, color: [f32; 3]) -> RgbdView {
    RgbdView::new(
        ColorImage::filled(width, height, color),
        DepthImage::filled(width, height, depth),
        synthetic_camera(width, height),
    )
}

/// Renders the plane `z = plane_z` (world frame) seen by a camera whose
/// rotation is ignored: rendered depth is `plane_z + t.z`.
///
/// The map only decides coverage: an empty store renders nothing, any other
/// store renders full coverage. Pose gradients are exact for the translation
/// z component; every primitive is reported visible with a fixed
/// screen-space gradient.
#[derive(Debug, Clone)]
pub struct PlaneRenderer {
    plane_z: f32,
    color: [f32; 3],
    screen_grad: [f32; 2],
    render_calls: usize,
    backward_calls: usize,
    fail_after: Option<usize>,
}

impl PlaneRenderer {
    pub fn new(plane_z: f32, color: [f32; 3]) -> Self {
        Self {
            plane_z,
            color,
            screen_grad: [0.0; 2],
            render_calls: 0,
            backward_calls: 0,
            fail_after: None,
        }
    }

    /// Screen-space gradient reported for every visible primitive
    pub fn with_screen_grad(mut self, grad: [f32; 2]) -> Self {
        self.screen_grad = grad;
        self
    }

    /// Fail every render after `renders` successful ones
    pub fn fail_after(&mut self, renders: usize) {
        self.fail_after = Some(renders);
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls
    }

    pub fn backward_calls(&self) -> usize {
        self.backward_calls
    }
}

impl Renderer for PlaneRenderer {
    fn render(
        &mut self,
        store: &PrimitiveStore,
        pose: &CameraPose,
        camera: &Camera,
    ) -> Result<RenderOutput, RenderError> {
        if let Some(limit) = self.fail_after {
            if self.render_calls >= limit {
                return Err(RenderError::Backend("injected failure".to_string()));
            }
        }
        self.render_calls += 1;

        let n = camera.pixel_count();
        if store.is_empty() {
            return Ok(RenderOutput {
                width: camera.width,
                height: camera.height,
                color: vec![0.0; n * 3],
                depth: vec![0.0; n],
                silhouette: vec![0.0; n],
            });
        }

        let depth = self.plane_z + pose.translation().z;
        let mut color = Vec::with_capacity(n * 3);
        for _ in 0..n {
            color.extend_from_slice(&self.color);
        }
        Ok(RenderOutput {
            width: camera.width,
            height: camera.height,
            color,
            depth: vec![depth; n],
            silhouette: vec![1.0; n],
        })
    }

    fn backward(
        &mut self,
        store: &PrimitiveStore,
        _pose: &CameraPose,
        _camera: &Camera,
        _output: &RenderOutput,
        image_grads: &ImageGradients,
    ) -> Result<Gradients, RenderError> {
        self.backward_calls += 1;
        if store.is_empty() {
            return Ok(Gradients::default());
        }

        let mut color_sum = [0.0f32; 3];
        for (i, g) in image_grads.color.iter().enumerate() {
            color_sum[i % 3] += g;
        }
        let share = 1.0 / store.len() as f32;

        let primitives = store
            .entries()
            .iter()
            .map(|_| {
                let mut grad = PrimitiveGrad {
                    screen: self.screen_grad,
                    visible: true,
                    ..Default::default()
                };
                for c in 0..3 {
                    grad.params[layout::COLOR + c] = color_sum[c] * share;
                }
                grad
            })
            .collect();

        Ok(Gradients {
            primitives,
            pose: PoseGrad {
                rotation: [0.0; 4],
                translation: Vec3::new(0.0, 0.0, image_grads.depth.iter().sum()),
            },
        })
    }
}

/// In-memory dataset of flat-plane frames
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    frames: Vec<RgbdFrame>,
    failing: Vec<usize>,
    camera: Camera,
}

impl SyntheticDataset {
    /// `count` frames of a wall at `depth`, optionally with ground-truth camera-to-world poses
    pub fn plane_sequence(
        count: usize,
        width: u32,
        height: u32,
        depth: f32,
        gt_c2w: Option<Vec<Mat4>>,
    ) -> Self {
        let frames = (0..count)
            .map(|i| {
                let frame = RgbdFrame::new(i, plane_view(width, height, depth, [0.5, 0.5, 0.5]));
                match gt_c2w.as_ref().and_then(|poses| poses.get(i)) {
                    Some(c2w) => frame.with_ground_truth(*c2w),
                    None => frame,
                }
            })
            .collect();
        Self {
            frames,
            failing: Vec::new(),
            camera: synthetic_camera(width, height),
        }
    }

    /// Make `index` fail to load
    pub fn fail_frame(&mut self, index: usize) {
        self.failing.push(index);
    }

    /// Replace the observation of one frame
    pub fn set_view(&mut self, index: usize, view: RgbdView) {
        if let Some(frame) = self.frames.get_mut(index) {
            frame.view = view;
        }
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn camera(&self) -> Camera {
        self.camera
    }

    fn load_frame(&self, index: usize) -> Result<RgbdFrame, DatasetError> {
        if self.failing.contains(&index) {
            return Err(DatasetError::Image(format!("frame {index} is unreadable")));
        }
        self.frames.get(index).cloned().ok_or(DatasetError::FrameIndex(index))
    }
}
