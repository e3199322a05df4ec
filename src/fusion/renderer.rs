//! Differentiable renderer boundary.
//!
//! The rasterization kernel is supplied by the caller. The engine only needs
//! a forward pass producing color, depth and silhouette images, and a backward
//! pass mapping per-pixel image gradients to per-primitive and pose gradients.

use glam::Vec3;
use thiserror::Error;

use crate::core::{Camera, CameraPose};

use super::store::{GradientCountMismatch, PrimitiveGrad, PrimitiveStore};

/// Rendering errors. Every variant is fatal for the current run.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer backend failed: {0}")]
    Backend(String),
    #[error("render output has {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("backward returned {actual} primitive gradients for {expected} primitives")]
    GradientCount { expected: usize, actual: usize },
}

impl From<GradientCountMismatch> for RenderError {
    fn from(err: GradientCountMismatch) -> Self {
        RenderError::GradientCount {
            expected: err.expected,
            actual: err.actual,
        }
    }
}

/// Forward pass result, row-major at the camera's resolution
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub width: u32,
    pub height: u32,
    /// HWC RGB
    pub color: Vec<f32>,
    pub depth: Vec<f32>,
    /// Accumulated alpha per pixel in [0, 1]
    pub silhouette: Vec<f32>,
}

impl RenderOutput {
    /// Check that every buffer matches `camera`
    pub fn validate(&self, camera: &Camera) -> Result<(), RenderError> {
        let n = camera.pixel_count();
        for (expected, actual) in [
            (n * 3, self.color.len()),
            (n, self.depth.len()),
            (n, self.silhouette.len()),
        ] {
            if expected != actual {
                return Err(RenderError::ShapeMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

/// Loss gradients with respect to the rendered images
#[derive(Debug, Clone)]
pub struct ImageGradients {
    /// dL/dcolor, HWC
    pub color: Vec<f32>,
    /// dL/ddepth
    pub depth: Vec<f32>,
}

impl ImageGradients {
    pub fn zeros(pixel_count: usize) -> Self {
        Self {
            color: vec![0.0; pixel_count * 3],
            depth: vec![0.0; pixel_count],
        }
    }
}

/// Gradient with respect to the world-to-camera pose
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseGrad {
    /// d/d(unnormalized quaternion), `[x, y, z, w]`
    pub rotation: [f32; 4],
    pub translation: Vec3,
}

impl Default for PoseGrad {
    fn default() -> Self {
        Self {
            rotation: [0.0; 4],
            translation: Vec3::ZERO,
        }
    }
}

/// Backward pass result; `primitives` follows store iteration order
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    pub primitives: Vec<PrimitiveGrad>,
    pub pose: PoseGrad,
}

/// Capability interface to a differentiable rasterizer.
///
/// Implementations must accept an empty store and return a valid (empty)
/// render for it.
pub trait Renderer {
    fn render(
        &mut self,
        store: &PrimitiveStore,
        pose: &CameraPose,
        camera: &Camera,
    ) -> Result<RenderOutput, RenderError>;

    fn backward(
        &mut self,
        store: &PrimitiveStore,
        pose: &CameraPose,
        camera: &Camera,
        output: &RenderOutput,
        image_grads: &ImageGradients,
    ) -> Result<Gradients, RenderError>;
}
