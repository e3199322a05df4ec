//! Camera pose representation using glam
//!
//! Poses are world-to-camera transforms. The rotation is kept as an
//! unnormalized quaternion so it can be optimized directly; every read goes
//! through [`CameraPose::rotation`], which normalizes.

use glam::{Mat3, Mat4, Quat, Vec3};

/// World-to-camera pose: unnormalized rotation + translation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    unnorm_rotation: Quat,
    translation: Vec3,
}

impl CameraPose {
    /// Create a pose from a (possibly unnormalized) quaternion and translation
    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            unnorm_rotation: rotation,
            translation,
        }
    }

    /// Create from `[x, y, z, w]` quaternion and `[x, y, z]` translation arrays
    pub fn from_arrays(quaternion: &[f32; 4], translation: &[f32; 3]) -> Self {
        Self::new(
            Quat::from_xyzw(quaternion[0], quaternion[1], quaternion[2], quaternion[3]),
            Vec3::from_array(*translation),
        )
    }

    /// Identity pose
    pub fn identity() -> Self {
        Self::new(Quat::IDENTITY, Vec3::ZERO)
    }

    /// Build from a rigid 4x4 transform
    pub fn from_matrix(m: &Mat4) -> Self {
        let rotation = Quat::from_mat3(&Mat3::from_mat4(*m));
        Self::new(rotation, m.w_axis.truncate())
    }

    /// Convert to 4x4 transformation matrix
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation(), self.translation)
    }

    /// Normalized rotation
    pub fn rotation(&self) -> Quat {
        let len = self.unnorm_rotation.length();
        if len > 1e-12 {
            self.unnorm_rotation / len
        } else {
            Quat::IDENTITY
        }
    }

    /// Raw optimizer-facing rotation
    pub fn unnormalized_rotation(&self) -> Quat {
        self.unnorm_rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn set_unnormalized_rotation(&mut self, rotation: Quat) {
        self.unnorm_rotation = rotation;
    }

    pub fn set_translation(&mut self, translation: Vec3) {
        self.translation = translation;
    }

    /// Compose two poses: self * other
    pub fn compose(&self, other: &CameraPose) -> CameraPose {
        let rotation = self.rotation();
        CameraPose::new(
            rotation * other.rotation(),
            self.translation + rotation * other.translation,
        )
    }

    /// Inverse of the pose
    pub fn inverse(&self) -> CameraPose {
        let rotation = self.rotation().inverse();
        CameraPose::new(rotation, -(rotation * self.translation))
    }

    /// Transform a world point into the camera frame
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation() * point + self.translation
    }

    /// True when every stored component is finite
    pub fn is_finite(&self) -> bool {
        self.unnorm_rotation.is_finite() && self.translation.is_finite()
    }

    /// Quaternion as `[x, y, z, w]` (unnormalized)
    pub fn quaternion(&self) -> [f32; 4] {
        self.unnorm_rotation.to_array()
    }

    /// Distance between the camera centers of two world-to-camera poses
    pub fn center_distance(&self, other: &CameraPose) -> f32 {
        let a = self.inverse().translation;
        let b = other.inverse().translation;
        (a - b).length()
    }

    /// Geodesic angle between the two rotations, in degrees
    pub fn rotation_angle_to(&self, other: &CameraPose) -> f32 {
        let dot = self.rotation().dot(other.rotation()).abs().min(1.0);
        (2.0 * dot.acos()).to_degrees()
    }
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_vec(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn test_compose_inverse_identity() {
        let pose = CameraPose::new(
            Quat::from_rotation_y(0.3),
            Vec3::new(0.5, -0.2, 1.0),
        );
        let ident = pose.compose(&pose.inverse());
        assert!(approx_vec(ident.translation(), Vec3::ZERO));
        assert!(ident.rotation_angle_to(&CameraPose::identity()) < 1e-2);
    }

    #[test]
    fn test_unnormalized_rotation_is_normalized_on_read() {
        let pose = CameraPose::new(Quat::from_xyzw(0.0, 0.0, 0.0, 3.0), Vec3::ZERO);
        let r = pose.rotation();
        assert!((r.length() - 1.0).abs() < 1e-6);
        assert!(approx_vec(pose.transform_point(Vec3::X), Vec3::X));
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = CameraPose::new(
            Quat::from_rotation_x(-0.4),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let back = CameraPose::from_matrix(&pose.to_matrix());
        assert!(approx_vec(back.translation(), pose.translation()));
        assert!(back.rotation_angle_to(&pose) < 1e-2);
    }

    #[test]
    fn test_non_finite_detected() {
        let pose = CameraPose::new(Quat::IDENTITY, Vec3::new(f32::NAN, 0.0, 0.0));
        assert!(!pose.is_finite());
        assert!(CameraPose::identity().is_finite());
    }

    #[test]
    fn test_center_distance() {
        let a = CameraPose::identity();
        let b = CameraPose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, -2.0));
        assert!((a.center_distance(&b) - 2.0).abs() < 1e-6);
    }
}
