//! RGB-D frame data

use glam::{Mat4, Vec3};

use super::camera::Camera;

/// Row-major RGB image with channels in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ColorImage {
    pub width: u32,
    pub height: u32,
    /// HWC layout, 3 floats per pixel
    pub data: Vec<f32>,
}

impl ColorImage {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self { width, height, data }
    }

    /// Image filled with a single color
    pub fn filled(width: u32, height: u32, color: [f32; 3]) -> Self {
        let n = width as usize * height as usize;
        let mut data = Vec::with_capacity(n * 3);
        for _ in 0..n {
            data.extend_from_slice(&color);
        }
        Self { width, height, data }
    }

    pub fn pixel(&self, index: usize) -> Vec3 {
        Vec3::new(self.data[index * 3], self.data[index * 3 + 1], self.data[index * 3 + 2])
    }
}

/// Row-major metric depth image; zero marks missing depth
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self { width, height, data }
    }

    pub fn filled(width: u32, height: u32, depth: f32) -> Self {
        Self {
            width,
            height,
            data: vec![depth; width as usize * height as usize],
        }
    }

    /// Depth at integer pixel (x, y), if inside the image
    pub fn at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y as usize * self.width as usize + x as usize).copied()
    }

    /// Largest finite depth, or 0 when the image holds none
    pub fn max_depth(&self) -> f32 {
        self.data
            .iter()
            .copied()
            .filter(|d| d.is_finite())
            .fold(0.0, f32::max)
    }

    /// Indices of pixels with valid (positive, finite) depth
    pub fn valid_indices(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_finite() && **d > 0.0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Color, depth and intrinsics at one resolution
#[derive(Debug, Clone)]
pub struct RgbdView {
    pub color: ColorImage,
    pub depth: DepthImage,
    pub camera: Camera,
}

impl RgbdView {
    pub fn new(color: ColorImage, depth: DepthImage, camera: Camera) -> Self {
        Self { color, depth, camera }
    }

    /// Whether color, depth and camera agree on the image size
    pub fn is_consistent(&self) -> bool {
        let n = self.camera.pixel_count();
        self.color.width == self.camera.width
            && self.color.height == self.camera.height
            && self.depth.width == self.camera.width
            && self.depth.height == self.camera.height
            && self.color.data.len() == n * 3
            && self.depth.data.len() == n
    }
}

/// One frame of the input stream
#[derive(Debug, Clone)]
pub struct RgbdFrame {
    /// Index of the frame in the input sequence
    pub index: usize,
    /// Tracking/mapping resolution
    pub view: RgbdView,
    /// Optional higher-resolution view used for map expansion
    pub densify_view: Option<RgbdView>,
    /// Ground-truth camera-to-world transform, when the source provides one
    pub gt_c2w: Option<Mat4>,
}

impl RgbdFrame {
    pub fn new(index: usize, view: RgbdView) -> Self {
        Self {
            index,
            view,
            densify_view: None,
            gt_c2w: None,
        }
    }

    pub fn with_ground_truth(mut self, c2w: Mat4) -> Self {
        self.gt_c2w = Some(c2w);
        self
    }

    pub fn with_densify_view(mut self, view: RgbdView) -> Self {
        self.densify_view = Some(view);
        self
    }

    /// View used to seed new primitives
    pub fn expansion_view(&self) -> &RgbdView {
        self.densify_view.as_ref().unwrap_or(&self.view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_indices_skip_missing_depth() {
        let depth = DepthImage::new(2, 2, vec![0.0, 1.0, f32::NAN, 2.0]);
        assert_eq!(depth.valid_indices(), vec![1, 3]);
        assert_eq!(depth.max_depth(), 2.0);
    }

    #[test]
    fn test_view_consistency() {
        let camera = Camera::new(10.0, 10.0, 2.0, 2.0, 4, 4);
        let view = RgbdView::new(
            ColorImage::filled(4, 4, [0.5, 0.5, 0.5]),
            DepthImage::filled(4, 4, 1.0),
            camera,
        );
        assert!(view.is_consistent());

        let bad = RgbdView::new(ColorImage::filled(3, 4, [0.0; 3]), DepthImage::filled(4, 4, 1.0), camera);
        assert!(!bad.is_consistent());
    }
}
