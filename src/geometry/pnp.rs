//! Perspective-n-Point: Kneip/Grunert P3P minimal solver inside RANSAC.
//!
//! Used by relocalization, where no motion prior exists. Poses returned here
//! are world-to-camera (`T_cw`).

use nalgebra::{DMatrix, Matrix3, Schur, Vector2, Vector3};
use rand::seq::index::sample;
use rand::Rng;

use crate::geometry::SE3;
use crate::tracking::frame::Camera;

/// RANSAC parameters.
#[derive(Debug, Clone)]
pub struct PnpRansacParams {
    pub iterations: usize,
    /// Chi-square threshold (2 DOF) on the squared reprojection error
    /// normalized by the keypoint variance.
    pub chi2: f64,
    pub min_inliers: usize,
}

impl Default for PnpRansacParams {
    fn default() -> Self {
        Self {
            iterations: 300,
            chi2: 5.991,
            min_inliers: 10,
        }
    }
}

/// Result of PnP solving.
pub struct PnPResult {
    /// Estimated camera pose (T_cw).
    pub pose_cw: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

/// Multiply two degree-4 polynomials (truncated to degree 4).
fn poly_mul(a: &[f64; 5], b: &[f64; 5]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for i in 0..5 {
        for j in 0..5 - i {
            out[i + j] += a[i] * b[j];
        }
    }
    out
}

/// Real roots of `Σ coeffs[i] xⁱ` from the eigenvalues of the companion matrix.
fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let Some(lead) = coeffs.iter().rposition(|c| c.abs() > 1e-12) else {
        return Vec::new();
    };
    if lead == 0 {
        return Vec::new();
    }
    let a = coeffs[lead];
    let mut comp = DMatrix::<f64>::zeros(lead, lead);
    for j in 0..lead {
        comp[(0, j)] = -coeffs[lead - 1 - j] / a;
    }
    for i in 1..lead {
        comp[(i, i - 1)] = 1.0;
    }

    let eigvals = Schur::new(comp).complex_eigenvalues();
    let mut roots: Vec<f64> = eigvals
        .iter()
        .filter(|v| v.im.abs() < 1e-8)
        .map(|v| v.re)
        .collect();
    roots.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-8);
    roots
}

/// Rigid transform `q = R p + t` aligning three or more point pairs (Kabsch).
fn align_points(world: &[Vector3<f64>], camera: &[Vector3<f64>]) -> Option<SE3> {
    let n = world.len() as f64;
    let cw = world.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let cc = camera.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix3::zeros();
    for (pw, pc) in world.iter().zip(camera) {
        h += (pw - cw) * (pc - cc).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let r = v * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * u.transpose();
    let t = cc - r * cw;
    Some(SE3::from_rt(&r, &t))
}

/// Solve P3P for three world points and unit bearing vectors.
///
/// Returns up to four `T_cw` candidates.
pub fn p3p(world: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Vec<SE3> {
    let a = (world[1] - world[2]).norm();
    let b = (world[0] - world[2]).norm();
    let c = (world[0] - world[1]).norm();
    if a <= f64::EPSILON || b <= f64::EPSILON || c <= f64::EPSILON {
        return Vec::new();
    }

    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let (a2, b2, c2) = (a * a, b * b, c * c);
    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // Distances along the bearings are x, y = u x, z = v x with v = N(u) / D(u).
    let n_poly = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d), 0.0, 0.0];
    let d_poly = [2.0 * cos_beta, -2.0 * cos_alpha, 0.0, 0.0, 0.0];
    let e_poly = [1.0 - e, 2.0 * e * cos_gamma, -e, 0.0, 0.0];

    let n2 = poly_mul(&n_poly, &n_poly);
    let nd = poly_mul(&n_poly, &d_poly);
    let ed2 = poly_mul(&e_poly, &poly_mul(&d_poly, &d_poly));

    let mut coeffs = [0.0; 5];
    for i in 0..5 {
        coeffs[i] = n2[i] - 2.0 * cos_beta * nd[i] + ed2[i];
    }

    let mut solutions = Vec::new();
    for u in real_roots(&coeffs) {
        let den = 2.0 * (cos_beta - u * cos_alpha);
        let k_val = 1.0 + u * u - 2.0 * u * cos_gamma;
        if den.abs() < 1e-12 || k_val <= 1e-12 {
            continue;
        }
        let v = (n_poly[0] + n_poly[1] * u + n_poly[2] * u * u) / den;
        let x = (c2 / k_val).sqrt();
        let (y, z) = (u * x, v * x);
        if y <= 0.0 || z <= 0.0 {
            continue;
        }

        let cam = [bearings[0] * x, bearings[1] * y, bearings[2] * z];
        if let Some(pose) = align_points(world, &cam) {
            solutions.push(pose);
        }
    }
    solutions
}

/// P3P RANSAC over 2D-3D correspondences.
///
/// `keypoints` are undistorted pixel coordinates and `sigma2` the variance of
/// each keypoint (from its pyramid level).
pub fn solve_pnp_ransac<R: Rng>(
    points: &[Vector3<f64>],
    keypoints: &[Vector2<f64>],
    sigma2: &[f64],
    camera: &Camera,
    params: &PnpRansacParams,
    rng: &mut R,
) -> Option<PnPResult> {
    let n = points.len();
    if n < 4 || keypoints.len() != n || sigma2.len() != n {
        return None;
    }
    let bearings: Vec<Vector3<f64>> = keypoints.iter().map(|kp| camera.bearing(kp)).collect();

    let count_inliers = |pose_cw: &SE3, mask: &mut Vec<bool>| -> usize {
        mask.clear();
        let mut count = 0;
        for i in 0..n {
            let pc = pose_cw.transform_point(&points[i]);
            let ok = camera
                .project(&pc)
                .map(|uv| (uv - keypoints[i]).norm_squared() < params.chi2 * sigma2[i])
                .unwrap_or(false);
            count += ok as usize;
            mask.push(ok);
        }
        count
    };

    let mut best: Option<PnPResult> = None;
    let mut mask = Vec::with_capacity(n);
    for _ in 0..params.iterations {
        let idx = sample(rng, n, 3);
        let world = [points[idx.index(0)], points[idx.index(1)], points[idx.index(2)]];
        let rays = [
            bearings[idx.index(0)],
            bearings[idx.index(1)],
            bearings[idx.index(2)],
        ];

        for pose_cw in p3p(&world, &rays) {
            let inliers = count_inliers(&pose_cw, &mut mask);
            if best.as_ref().map_or(true, |b| inliers > b.num_inliers) {
                best = Some(PnPResult {
                    pose_cw,
                    inlier_mask: mask.clone(),
                    num_inliers: inliers,
                });
            }
        }

        if best.as_ref().is_some_and(|b| b.num_inliers * 10 >= n * 9) {
            break;
        }
    }

    let best = best.filter(|b| b.num_inliers >= params.min_inliers)?;

    // Polish on all inliers: align rays scaled by the current depth estimate.
    let (world, cam): (Vec<_>, Vec<_>) = (0..n)
        .filter(|&i| best.inlier_mask[i])
        .map(|i| {
            let depth = best.pose_cw.transform_point(&points[i]).norm();
            (points[i], bearings[i] * depth)
        })
        .unzip();
    if let Some(refined) = align_points(&world, &cam) {
        let inliers = count_inliers(&refined, &mut mask);
        if inliers >= best.num_inliers {
            return Some(PnPResult {
                pose_cw: refined,
                inlier_mask: mask,
                num_inliers: inliers,
            });
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn ground_truth() -> SE3 {
        SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2),
            Vector3::new(0.1, -0.05, 1.0),
        )
    }

    fn pose_error(a: &SE3, b: &SE3) -> (f64, f64) {
        (
            (a.translation - b.translation).norm(),
            a.rotation.angle_to(&b.rotation),
        )
    }

    #[test]
    fn test_p3p_recovers_pose_from_minimal_set() {
        let gt = ground_truth();
        let world = [
            Vector3::new(0.2, -0.1, 0.8),
            Vector3::new(-0.1, 0.2, 1.1),
            Vector3::new(0.15, 0.1, 0.9),
        ];
        let bearings = world.map(|p| gt.transform_point(&p).normalize());

        let sols = p3p(&world, &bearings);
        assert!(!sols.is_empty());
        let best = sols
            .iter()
            .map(|s| pose_error(s, &gt))
            .fold((f64::INFINITY, f64::INFINITY), |acc, e| {
                if e.0 < acc.0 { e } else { acc }
            });
        assert!(best.0 < 1e-4, "translation error too large: {}", best.0);
        assert!(best.1 < 1e-4, "rotation error too large: {}", best.1);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let cam = camera();
        let gt = ground_truth();
        let mut points = Vec::new();
        let mut keypoints = Vec::new();
        for i in 0..40 {
            let p = Vector3::new(
                (i % 8) as f64 * 0.3 - 1.0,
                (i / 8) as f64 * 0.3 - 0.6,
                3.0 + 0.2 * (i % 3) as f64,
            );
            let uv = cam.project(&gt.transform_point(&p)).unwrap();
            points.push(p);
            keypoints.push(uv);
        }
        // Corrupt a quarter of the observations.
        for kp in keypoints.iter_mut().step_by(4) {
            kp.x += 40.0;
        }
        let sigma2 = vec![1.0; points.len()];
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let result = solve_pnp_ransac(
            &points,
            &keypoints,
            &sigma2,
            &cam,
            &PnpRansacParams::default(),
            &mut rng,
        )
        .unwrap();

        assert_eq!(result.num_inliers, 30);
        assert!(result.inlier_mask.iter().step_by(4).all(|m| !m));
        let (dt, dr) = pose_error(&result.pose_cw, &gt);
        assert!(dt < 1e-5 && dr < 1e-5, "dt={} dr={}", dt, dr);
    }
}
