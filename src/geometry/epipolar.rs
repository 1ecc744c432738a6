//! Two-view model estimation: homography and fundamental matrix from
//! point correspondences, and their decomposition into motion hypotheses.
//!
//! Conventions follow the initializer: `x2 ~ H21 x1` and `x2ᵀ F21 x1 = 0`.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

/// Hartley normalization: centroid to origin, mean absolute deviation 1 per axis.
///
/// Returns the normalized points and the transform `T` with `x_n = T x`.
pub fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    let mut dev = Vector2::zeros();
    for p in points {
        dev.x += (p.x - mean.x).abs();
        dev.y += (p.y - mean.y).abs();
    }
    dev /= n;
    if dev.x <= f64::EPSILON || dev.y <= f64::EPSILON {
        return None;
    }

    let sx = 1.0 / dev.x;
    let sy = 1.0 / dev.y;
    let normalized = points
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(
        sx, 0.0, -mean.x * sx,
        0.0, sy, -mean.y * sy,
        0.0, 0.0, 1.0,
    );
    Some((normalized, t))
}

/// Right null vector of `a` (singular vector of the smallest singular value).
///
/// Wide systems are padded with zero rows so the SVD yields a full `Vᵀ`.
fn null_vector(a: DMatrix<f64>) -> Option<Vec<f64>> {
    let cols = a.ncols();
    let a = if a.nrows() < cols {
        let mut padded = DMatrix::<f64>::zeros(cols, cols);
        padded.view_mut((0, 0), (a.nrows(), cols)).copy_from(&a);
        padded
    } else {
        a
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let idx = svd.singular_values.imin();
    Some(v_t.row(idx).iter().copied().collect())
}

fn mat3_from_slice(v: &[f64]) -> Matrix3<f64> {
    Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8])
}

/// DLT homography `x2 ~ H x1` on (already normalized) points.
pub fn compute_homography(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 4 || p2.len() != n {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (a1, a2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (a1.x, a1.y, a2.x, a2.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 3)] = -u1;
        a[(r0, 4)] = -v1;
        a[(r0, 5)] = -1.0;
        a[(r0, 6)] = v2 * u1;
        a[(r0, 7)] = v2 * v1;
        a[(r0, 8)] = v2;

        a[(r1, 0)] = u1;
        a[(r1, 1)] = v1;
        a[(r1, 2)] = 1.0;
        a[(r1, 6)] = -u2 * u1;
        a[(r1, 7)] = -u2 * v1;
        a[(r1, 8)] = -u2;
    }
    null_vector(a).map(|h| mat3_from_slice(&h))
}

/// 8-point fundamental matrix `x2ᵀ F x1 = 0` on (already normalized)
/// points, forced to rank 2.
pub fn compute_fundamental(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 8 || p2.len() != n {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, (a1, a2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (a1.x, a1.y, a2.x, a2.y);
        a[(i, 0)] = u2 * u1;
        a[(i, 1)] = u2 * v1;
        a[(i, 2)] = u2;
        a[(i, 3)] = v2 * u1;
        a[(i, 4)] = v2 * v1;
        a[(i, 5)] = v2;
        a[(i, 6)] = u1;
        a[(i, 7)] = v1;
        a[(i, 8)] = 1.0;
    }
    let f_pre = mat3_from_slice(&null_vector(a)?);

    let svd = f_pre.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut s = svd.singular_values;
    let imin = s.imin();
    s[imin] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

/// Decompose an essential matrix into its two rotations and the translation
/// direction. The four motion hypotheses are `(R1, t)`, `(R2, t)`, `(R1, -t)`
/// and `(R2, -t)`.
pub fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let t_col = u.column(svd.singular_values.imin()).into_owned();
    let norm = t_col.norm();
    if norm < f64::EPSILON {
        return None;
    }
    let t = t_col / norm;

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    Some((r1, r2, t))
}

/// One motion hypothesis extracted from a homography.
#[derive(Debug, Clone)]
pub struct HomographyMotion {
    pub rotation: Matrix3<f64>,
    /// Unit translation direction.
    pub translation: Vector3<f64>,
    /// Plane normal in the first camera, facing the camera (`n_z > 0`).
    pub normal: Vector3<f64>,
}

/// Faugeras' decomposition of a calibrated homography into up to eight
/// motion hypotheses. `h21` is in pixel coordinates and `k` the intrinsics.
///
/// Returns an empty list when the singular values are too close to
/// distinguish the solutions.
pub fn decompose_homography(h21: &Matrix3<f64>, k: &Matrix3<f64>) -> Vec<HomographyMotion> {
    let Some(k_inv) = k.try_inverse() else {
        return Vec::new();
    };
    let a = k_inv * h21 * k;

    let svd = a.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Vec::new();
    };

    // Sort singular values descending, permuting U and Vᵀ to match.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&i, &j| {
        svd.singular_values[j]
            .partial_cmp(&svd.singular_values[i])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let u = Matrix3::from_columns(&[u.column(order[0]), u.column(order[1]), u.column(order[2])]);
    let v_t = Matrix3::from_rows(&[v_t.row(order[0]), v_t.row(order[1]), v_t.row(order[2])]);
    let v = v_t.transpose();
    let d1 = svd.singular_values[order[0]];
    let d2 = svd.singular_values[order[1]];
    let d3 = svd.singular_values[order[2]];

    if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return Vec::new();
    }

    let s = u.determinant() * v_t.determinant();

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    let mut motions = Vec::with_capacity(8);
    let mut push = |rp: Matrix3<f64>, tp: Vector3<f64>, np: Vector3<f64>| {
        let rotation = s * u * rp * v_t;
        let t = u * tp;
        let t_norm = t.norm();
        if t_norm < f64::EPSILON {
            return;
        }
        let mut normal = v * np;
        if normal.z < 0.0 {
            normal = -normal;
        }
        motions.push(HomographyMotion {
            rotation,
            translation: t / t_norm,
            normal,
        });
    };

    // d' = d2
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        let rp = Matrix3::new(
            ctheta, 0.0, -stheta[i],
            0.0, 1.0, 0.0,
            stheta[i], 0.0, ctheta,
        );
        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        let np = Vector3::new(x1[i], 0.0, x3[i]);
        push(rp, tp, np);
    }

    // d' = -d2
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        let rp = Matrix3::new(
            cphi, 0.0, sphi[i],
            0.0, -1.0, 0.0,
            sphi[i], 0.0, -cphi,
        );
        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        let np = Vector3::new(x1[i], 0.0, x3[i]);
        push(rp, tp, np);
    }

    motions
}

/// Essential matrix `[t]× R` for a relative motion.
pub fn essential_from_motion(r: &Matrix3<f64>, t: &Vector3<f64>) -> Matrix3<f64> {
    super::so3::skew(t) * r
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
        let q = k * p;
        Vector2::new(q.x / q.z, q.y / q.z)
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..24)
            .map(|i| {
                let x = (i % 6) as f64 * 0.4 - 1.0;
                let y = (i / 6) as f64 * 0.5 - 0.75;
                Vector3::new(x, y, 4.0 + 0.37 * ((i * 7) % 5) as f64)
            })
            .collect()
    }

    #[test]
    fn test_fundamental_satisfies_epipolar_constraint() {
        let k = intrinsics();
        let r = Rotation3::from_euler_angles(0.02, -0.05, 0.01).into_inner();
        let t = Vector3::new(0.3, 0.05, 0.02);
        let pts = scene();
        let p1: Vec<_> = pts.iter().map(|p| project(&k, p)).collect();
        let p2: Vec<_> = pts.iter().map(|p| project(&k, &(r * p + t))).collect();

        let (n1, t1) = normalize_points(&p1).unwrap();
        let (n2, t2) = normalize_points(&p2).unwrap();
        let f_norm = compute_fundamental(&n1, &n2).unwrap();
        // Rank 2 is enforced by zeroing the smallest singular value.
        assert!(f_norm.svd(false, false).singular_values.min() < 1e-12);
        let f = t2.transpose() * f_norm * t1;

        for (a, b) in p1.iter().zip(&p2) {
            let residual = b.push(1.0).dot(&(f * a.push(1.0)));
            // Scale-free check: compare with the line norm.
            let line = f * a.push(1.0);
            let dist = residual.abs() / (line.x * line.x + line.y * line.y).sqrt();
            assert!(dist < 1e-6, "epipolar distance {}", dist);
        }
    }

    #[test]
    fn test_homography_maps_plane_points() {
        let k = intrinsics();
        let r = Rotation3::from_euler_angles(0.0, 0.04, 0.0).into_inner();
        let t = Vector3::new(0.4, 0.0, 0.0);
        let pts: Vec<_> = scene().into_iter().map(|p| Vector3::new(p.x, p.y, 5.0)).collect();
        let p1: Vec<_> = pts.iter().map(|p| project(&k, p)).collect();
        let p2: Vec<_> = pts.iter().map(|p| project(&k, &(r * p + t))).collect();

        let (n1, t1) = normalize_points(&p1).unwrap();
        let (n2, t2) = normalize_points(&p2).unwrap();
        let hn = compute_homography(&n1, &n2).unwrap();
        let h = t2.try_inverse().unwrap() * hn * t1;

        for (a, b) in p1.iter().zip(&p2) {
            let q = h * a.push(1.0);
            assert_relative_eq!(Vector2::new(q.x / q.z, q.y / q.z), *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_decompose_essential_contains_true_motion() {
        let r = Rotation3::from_euler_angles(0.1, -0.2, 0.05).into_inner();
        let t = Vector3::new(1.0, 0.2, -0.1).normalize();
        let e = essential_from_motion(&r, &t);

        let (r1, r2, t_est) = decompose_essential(&e).unwrap();
        let rot_match = (r1 - r).norm() < 1e-6 || (r2 - r).norm() < 1e-6;
        let t_match = (t_est - t).norm() < 1e-6 || (t_est + t).norm() < 1e-6;
        assert!(rot_match);
        assert!(t_match);
    }

    #[test]
    fn test_decompose_homography_contains_true_motion() {
        let k = intrinsics();
        let r = Rotation3::from_euler_angles(0.03, 0.08, -0.02).into_inner();
        let t = Vector3::new(0.5, 0.1, 0.05);
        // Plane z = 5 in camera 1: nᵀX = d with n = (0,0,1), d = 5.
        let n = Vector3::new(0.0, 0.0, 1.0);
        let h = k * (r + t * n.transpose() / 5.0) * k.try_inverse().unwrap();

        let motions = decompose_homography(&h, &k);
        assert_eq!(motions.len(), 8);
        let t_dir = t.normalize();
        assert!(motions.iter().any(|m| {
            (m.rotation - r).norm() < 1e-6 && (m.translation - t_dir).norm() < 1e-6
        }));
    }
}
