//! Pinhole camera model

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics for one image resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length x (pixels)
    pub fx: f32,
    /// Focal length y (pixels)
    pub fy: f32,
    /// Principal point x
    pub cx: f32,
    /// Principal point y
    pub cy: f32,
    /// Image width
    pub width: u32,
    /// Image height
    pub height: u32,
}

impl Camera {
    /// Create a new camera with given parameters
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self { fx, fy, cx, cy, width, height }
    }

    /// Number of pixels in one image
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Average focal length, used for projective scale initialization
    pub fn mean_focal(&self) -> f32 {
        0.5 * (self.fx + self.fy)
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points on or behind the image plane.
    pub fn project(&self, point: Vec3) -> Option<Vec2> {
        if point.z <= 0.0 {
            return None;
        }
        Some(Vec2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Unproject a pixel at the given depth into the camera frame
    pub fn unproject(&self, u: f32, v: f32, depth: f32) -> Vec3 {
        Vec3::new(
            (u - self.cx) / self.fx * depth,
            (v - self.cy) / self.fy * depth,
            depth,
        )
    }

    /// Check if a pixel lies inside the image, `margin` pixels away from every edge
    pub fn is_in_image(&self, pixel: Vec2, margin: f32) -> bool {
        pixel.x >= margin
            && pixel.x < self.width as f32 - margin
            && pixel.y >= margin
            && pixel.y < self.height as f32 - margin
    }

    /// Intrinsics for the same sensor resampled to `width` x `height`
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            width,
            height,
        }
    }
}
