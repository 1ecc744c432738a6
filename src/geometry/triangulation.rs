//! Linear two-view triangulation.

use nalgebra::{Matrix3x4, Matrix4, Vector2, Vector3};

use super::SE3;

/// 3x4 projection matrix `[R | t]` for a world-to-camera transform.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&pose_cw.rotation_matrix());
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&pose_cw.translation);
    p
}

/// DLT triangulation from two projection matrices and the matching
/// observations (normalized or pixel coordinates, consistent with `p1`/`p2`).
///
/// Returns `None` when the solution lies at infinity or is not finite.
pub fn triangulate(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = x1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = x1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = x2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = x2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let smallest = svd.singular_values.imin();
    let x_h = v_t.row(smallest);

    if x_h[3].abs() < 1e-12 {
        return None;
    }
    let x = Vector3::new(x_h[0] / x_h[3], x_h[1] / x_h[3], x_h[2] / x_h[3]);
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

/// Triangulate normalized observations taken from two world-to-camera poses.
pub fn triangulate_dlt(
    xn1: &Vector2<f64>,
    xn2: &Vector2<f64>,
    pose1_cw: &SE3,
    pose2_cw: &SE3,
) -> Option<Vector3<f64>> {
    triangulate(
        &projection_matrix(pose1_cw),
        &projection_matrix(pose2_cw),
        xn1,
        xn2,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_triangulate_dlt() {
        let point = Vector3::new(0.4, -0.2, 5.0);
        let pose1 = SE3::identity();
        let pose2 = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(-0.5, 0.0, 0.0),
        );

        let project = |pose: &SE3| {
            let pc = pose.transform_point(&point);
            Vector2::new(pc.x / pc.z, pc.y / pc.z)
        };

        let x = triangulate_dlt(&project(&pose1), &project(&pose2), &pose1, &pose2).unwrap();
        assert_relative_eq!(x, point, epsilon = 1e-8);
    }

    #[test]
    fn test_projection_matrix_matches_transform() {
        let pose = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.1, 0.2, -0.3),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let p = Vector3::new(-1.0, 0.5, 2.0);
        let projected = projection_matrix(&pose) * p.push(1.0);
        assert_relative_eq!(projected, pose.transform_point(&p), epsilon = 1e-12);
    }
}
