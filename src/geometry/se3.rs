//! Rigid body transforms.
//!
//! Poses stored on keyframes and frames are `T_wc` (camera-to-world). Use
//! [`SE3::inverse`] to obtain `T_cw` when projecting world points.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// A rigid transform `p' = R p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_quaternion(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix (re-orthonormalized) and translation.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation: *translation,
        }
    }

    /// Build from a homogeneous 4x4 matrix.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into_owned();
        Self::from_rt(&r, &t)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self * other`
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
