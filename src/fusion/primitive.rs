//! Gaussian primitive parameters.
//!
//! Parameters live in their optimization space: rotation as an unnormalized
//! quaternion, scale as log-scale and opacity as a logit. Readers always go
//! through the accessor transforms, which guarantee a unit rotation, a
//! positive scale and an opacity strictly inside (0, 1).

use glam::{Quat, Vec3};

/// Number of scalar parameters per primitive
pub const PARAM_DIM: usize = 14;

/// Offsets of each parameter group in the flat layout
pub mod layout {
    pub const POSITION: usize = 0;
    pub const COLOR: usize = 3;
    /// `[w, x, y, z]`
    pub const ROTATION: usize = 6;
    pub const OPACITY: usize = 10;
    pub const LOG_SCALE: usize = 11;
}

/// One 3D Gaussian
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primitive {
    pub position: Vec3,
    pub color: Vec3,
    /// Unnormalized quaternion, `[w, x, y, z]`
    pub unnorm_rotation: [f32; 4],
    pub logit_opacity: f32,
    pub log_scales: Vec3,
}

impl Primitive {
    /// Axis-aligned primitive with the given world scale and opacity
    pub fn new(position: Vec3, color: Vec3, scale: f32, opacity: f32) -> Self {
        let log_scale = scale.max(f32::MIN_POSITIVE).ln();
        Self {
            position,
            color,
            unnorm_rotation: [1.0, 0.0, 0.0, 0.0],
            logit_opacity: opacity_to_logit(opacity),
            log_scales: Vec3::splat(log_scale),
        }
    }

    /// Normalized rotation
    pub fn rotation(&self) -> Quat {
        let [w, x, y, z] = self.unnorm_rotation;
        let q = Quat::from_xyzw(x, y, z, w);
        let len = q.length();
        if len.is_finite() && len > 1e-12 {
            q / len
        } else {
            Quat::IDENTITY
        }
    }

    /// Per-axis world scale, always > 0
    pub fn scales(&self) -> Vec3 {
        Vec3::new(
            positive_exp(self.log_scales.x),
            positive_exp(self.log_scales.y),
            positive_exp(self.log_scales.z),
        )
    }

    pub fn max_scale(&self) -> f32 {
        self.scales().max_element()
    }

    /// Opacity in (0, 1)
    pub fn opacity(&self) -> f32 {
        sigmoid(self.logit_opacity)
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.logit_opacity = opacity_to_logit(opacity);
    }

    pub fn to_array(&self) -> [f32; PARAM_DIM] {
        let mut out = [0.0; PARAM_DIM];
        out[layout::POSITION..layout::POSITION + 3].copy_from_slice(&self.position.to_array());
        out[layout::COLOR..layout::COLOR + 3].copy_from_slice(&self.color.to_array());
        out[layout::ROTATION..layout::ROTATION + 4].copy_from_slice(&self.unnorm_rotation);
        out[layout::OPACITY] = self.logit_opacity;
        out[layout::LOG_SCALE..layout::LOG_SCALE + 3].copy_from_slice(&self.log_scales.to_array());
        out
    }

    pub fn from_array(values: &[f32; PARAM_DIM]) -> Self {
        let v3 = |at: usize| Vec3::new(values[at], values[at + 1], values[at + 2]);
        Self {
            position: v3(layout::POSITION),
            color: v3(layout::COLOR),
            unnorm_rotation: [
                values[layout::ROTATION],
                values[layout::ROTATION + 1],
                values[layout::ROTATION + 2],
                values[layout::ROTATION + 3],
            ],
            logit_opacity: values[layout::OPACITY],
            log_scales: v3(layout::LOG_SCALE),
        }
    }
}

/// Numerically safe logistic function; the result never reaches 0 or 1.
pub fn sigmoid(x: f32) -> f32 {
    let s = 1.0 / (1.0 + (-x).exp());
    s.clamp(f32::EPSILON, 1.0 - f32::EPSILON)
}

/// Inverse of [`sigmoid`] with the input clamped away from 0 and 1
pub fn opacity_to_logit(opacity: f32) -> f32 {
    let clamped = opacity.clamp(1e-6, 1.0 - 1e-6);
    (clamped / (1.0 - clamped)).ln()
}

fn positive_exp(x: f32) -> f32 {
    x.exp().max(f32::MIN_POSITIVE)
}
