//! SO(3) helpers used by the pose refinement Jacobians.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Right Jacobian Jr(φ) of SO(3):
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi_sq
}

/// Left Jacobian, `Jl(φ) = Jr(-φ)`.
///
/// Perturbing the rotation vector of `exp(φ) R0` by δ rotates the result by
/// approximately `Jl(φ) δ` on the left.
pub fn left_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian_so3(&(-phi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        assert_relative_eq!(
            right_jacobian_so3(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_left_jacobian_first_order() {
        // exp(φ + δ) ≈ exp(Jl δ) exp(φ)
        let phi = Vector3::new(0.2, -0.1, 0.4);
        let delta = Vector3::new(1e-3, -2e-3, 1.5e-3);

        let lhs = exp(&(phi + delta));
        let rhs = exp(&(left_jacobian_so3(&phi) * delta)) * exp(&phi);

        assert_relative_eq!(lhs.angle_to(&rhs), 0.0, epsilon = 1e-5);
    }
}
