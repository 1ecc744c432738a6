//! Monocular map initialization from two views.
//!
//! A homography (planar or low-parallax scenes) and a fundamental matrix
//! (general scenes) are estimated in parallel with RANSAC over the same
//! minimal sets. The model is chosen by the ratio of their symmetric
//! transfer scores, decomposed into motion hypotheses, and the hypothesis
//! that triangulates the most points in front of both cameras with enough
//! parallax wins.
//!
//! The reference frame becomes the world origin; translation has arbitrary
//! (unit) scale until the tracker normalizes the map by its median depth.

use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use rand::seq::index::sample;
use rand::Rng;
use tracing::debug;

use crate::config::InitializerConfig;
use crate::geometry::epipolar::{
    compute_fundamental, compute_homography, decompose_essential, decompose_homography,
    normalize_points,
};
use crate::geometry::{triangulate, SE3};
use crate::tracking::frame::{Camera, KeyPoint};

/// χ² (1 DOF, 95%) used to accept fundamental-matrix inliers.
const CHI2_LINE: f64 = 3.841;
/// χ² (2 DOF, 95%) used for homography inliers and both scores.
const CHI2_POINT: f64 = 5.991;
/// Homography is selected when its share of the total score exceeds this.
const HOMOGRAPHY_RATIO: f64 = 0.40;
const MAX_PARALLAX_COS: f64 = 0.99998;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoViewModel {
    Homography,
    Fundamental,
}

/// A successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// World-to-camera pose of the current frame. The reference is identity.
    pub pose_cw: SE3,
    /// Triangulated points (reference frame), indexed by reference keypoint.
    pub points: Vec<Option<Vector3<f64>>>,
    pub parallax_deg: f64,
    pub model: TwoViewModel,
}

impl TwoViewReconstruction {
    pub fn num_points(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

struct ModelFit {
    matrix: Matrix3<f64>,
    inliers: Vec<bool>,
    score: f64,
}

struct Hypothesis {
    good: usize,
    points: Vec<Option<Vector3<f64>>>,
    parallax_deg: f64,
    pose_cw: SE3,
}

/// Holds the reference frame while waiting for a second frame with enough
/// parallax.
pub struct Initializer {
    reference: Vec<KeyPoint>,
    /// Where each reference keypoint was last matched. Seeds the next search.
    pub prev_matched: Vec<Vector2<f64>>,
    inv_sigma2: f64,
    config: InitializerConfig,
}

impl Initializer {
    /// `keypoints` must be undistorted.
    pub fn new(keypoints: &[KeyPoint], config: &InitializerConfig) -> Self {
        let sigma2 = config.sigma * config.sigma;
        Self {
            reference: keypoints.to_vec(),
            prev_matched: keypoints.iter().map(|kp| kp.pt).collect(),
            inv_sigma2: 1.0 / sigma2,
            config: config.clone(),
        }
    }

    pub fn num_reference_features(&self) -> usize {
        self.reference.len()
    }

    /// Try to reconstruct the scene from `matches12[i_ref] = Some(i_cur)`.
    pub fn initialize<R: Rng>(
        &self,
        current: &[KeyPoint],
        matches12: &[Option<usize>],
        camera: &Camera,
        rng: &mut R,
    ) -> Option<TwoViewReconstruction> {
        let pairs: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .filter(|&(i1, i2)| i1 < self.reference.len() && i2 < current.len())
            .collect();
        if pairs.len() < 8 {
            return None;
        }
        let p1: Vec<Vector2<f64>> = pairs.iter().map(|&(i1, _)| self.reference[i1].pt).collect();
        let p2: Vec<Vector2<f64>> = pairs.iter().map(|&(_, i2)| current[i2].pt).collect();

        let sets: Vec<Vec<usize>> = (0..self.config.ransac_iterations.max(1))
            .map(|_| sample(rng, pairs.len(), 8).into_vec())
            .collect();

        let homography = self.find_homography(&p1, &p2, &sets);
        let fundamental = self.find_fundamental(&p1, &p2, &sets);
        let sh = homography.as_ref().map_or(0.0, |m| m.score);
        let sf = fundamental.as_ref().map_or(0.0, |m| m.score);
        if sh + sf <= 0.0 {
            return None;
        }
        let rh = sh / (sh + sf);
        debug!("[Initializer] {} matches, SH={:.1} SF={:.1} RH={:.2}", pairs.len(), sh, sf, rh);

        let k = camera.k_matrix();
        let (model, best) = if rh > HOMOGRAPHY_RATIO {
            (TwoViewModel::Homography, self.reconstruct_h(homography?, &p1, &p2, &k)?)
        } else {
            (TwoViewModel::Fundamental, self.reconstruct_f(fundamental?, &p1, &p2, &k)?)
        };

        let mut points = vec![None; self.reference.len()];
        for (&(i1, _), p) in pairs.iter().zip(best.points) {
            points[i1] = p;
        }
        Some(TwoViewReconstruction {
            pose_cw: best.pose_cw,
            points,
            parallax_deg: best.parallax_deg,
            model,
        })
    }

    fn find_homography(&self, p1: &[Vector2<f64>], p2: &[Vector2<f64>], sets: &[Vec<usize>]) -> Option<ModelFit> {
        let (n1, t1) = normalize_points(p1)?;
        let (n2, t2) = normalize_points(p2)?;
        let t2_inv = t2.try_inverse()?;

        let mut best: Option<ModelFit> = None;
        for set in sets {
            let s1: Vec<Vector2<f64>> = set.iter().map(|&i| n1[i]).collect();
            let s2: Vec<Vector2<f64>> = set.iter().map(|&i| n2[i]).collect();
            let Some(hn) = compute_homography(&s1, &s2) else {
                continue;
            };
            let h21 = t2_inv * hn * t1;
            let Some(h12) = h21.try_inverse() else {
                continue;
            };
            let (score, inliers) = self.check_homography(&h21, &h12, p1, p2);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(ModelFit {
                    matrix: h21,
                    inliers,
                    score,
                });
            }
        }
        best
    }

    fn find_fundamental(&self, p1: &[Vector2<f64>], p2: &[Vector2<f64>], sets: &[Vec<usize>]) -> Option<ModelFit> {
        let (n1, t1) = normalize_points(p1)?;
        let (n2, t2) = normalize_points(p2)?;

        let mut best: Option<ModelFit> = None;
        for set in sets {
            let s1: Vec<Vector2<f64>> = set.iter().map(|&i| n1[i]).collect();
            let s2: Vec<Vector2<f64>> = set.iter().map(|&i| n2[i]).collect();
            let Some(fn_) = compute_fundamental(&s1, &s2) else {
                continue;
            };
            let f21 = t2.transpose() * fn_ * t1;
            let (score, inliers) = self.check_fundamental(&f21, p1, p2);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(ModelFit {
                    matrix: f21,
                    inliers,
                    score,
                });
            }
        }
        best
    }

    /// Symmetric transfer score of a homography.
    fn check_homography(
        &self,
        h21: &Matrix3<f64>,
        h12: &Matrix3<f64>,
        p1: &[Vector2<f64>],
        p2: &[Vector2<f64>],
    ) -> (f64, Vec<bool>) {
        let mut score = 0.0;
        let mut inliers = Vec::with_capacity(p1.len());
        for (x1, x2) in p1.iter().zip(p2) {
            let mut inlier = true;
            for (src, dst, h) in [(x2, x1, h12), (x1, x2, h21)] {
                let chi2 = transfer(h, src)
                    .map(|proj| (dst - proj).norm_squared() * self.inv_sigma2)
                    .unwrap_or(f64::INFINITY);
                if chi2 > CHI2_POINT {
                    inlier = false;
                } else {
                    score += CHI2_POINT - chi2;
                }
            }
            inliers.push(inlier);
        }
        (score, inliers)
    }

    /// Symmetric epipolar-distance score of a fundamental matrix.
    fn check_fundamental(&self, f21: &Matrix3<f64>, p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> (f64, Vec<bool>) {
        let mut score = 0.0;
        let mut inliers = Vec::with_capacity(p1.len());
        for (x1, x2) in p1.iter().zip(p2) {
            let x1h = Vector3::new(x1.x, x1.y, 1.0);
            let x2h = Vector3::new(x2.x, x2.y, 1.0);
            // Line in image 2 is F21 x1; line in image 1 is F21ᵀ x2.
            let lines = [(f21 * x1h, x2), (f21.transpose() * x2h, x1)];
            let mut inlier = true;
            for (line, x) in lines {
                let num = line.x * x.x + line.y * x.y + line.z;
                let den = line.x * line.x + line.y * line.y;
                let chi2 = if den > 0.0 {
                    num * num / den * self.inv_sigma2
                } else {
                    f64::INFINITY
                };
                if chi2 > CHI2_LINE {
                    inlier = false;
                } else {
                    score += CHI2_POINT - chi2;
                }
            }
            inliers.push(inlier);
        }
        (score, inliers)
    }

    fn reconstruct_f(
        &self,
        fit: ModelFit,
        p1: &[Vector2<f64>],
        p2: &[Vector2<f64>],
        k: &Matrix3<f64>,
    ) -> Option<Hypothesis> {
        let n_inliers = fit.inliers.iter().filter(|&&b| b).count();
        let e21 = k.transpose() * fit.matrix * k;
        let (r1, r2, t) = decompose_essential(&e21)?;

        let hypotheses: Vec<Hypothesis> = [(r1, t), (r2, t), (r1, -t), (r2, -t)]
            .iter()
            .map(|(r, t)| self.check_rt(r, t, p1, p2, &fit.inliers, k))
            .collect();
        let max_good = hypotheses.iter().map(|h| h.good).max().unwrap_or(0);
        let min_good = ((0.9 * n_inliers as f64) as usize).max(self.config.min_triangulated);
        let similar = hypotheses
            .iter()
            .filter(|h| h.good as f64 > 0.7 * max_good as f64)
            .count();
        debug!(
            "[Initializer] F: {} inliers, best hypothesis {} good, {} similar",
            n_inliers, max_good, similar
        );
        if max_good < min_good || similar > 1 {
            return None;
        }

        hypotheses
            .into_iter()
            .find(|h| h.good == max_good)
            .filter(|h| h.parallax_deg > self.config.min_parallax_deg)
    }

    fn reconstruct_h(
        &self,
        fit: ModelFit,
        p1: &[Vector2<f64>],
        p2: &[Vector2<f64>],
        k: &Matrix3<f64>,
    ) -> Option<Hypothesis> {
        let n_inliers = fit.inliers.iter().filter(|&&b| b).count();

        let mut best: Option<Hypothesis> = None;
        let mut second_good = 0;
        for motion in decompose_homography(&fit.matrix, k) {
            let hyp = self.check_rt(&motion.rotation, &motion.translation, p1, p2, &fit.inliers, k);
            // Near-degenerate motions keep far points that never fail
            // cheirality; they must not compete with the real motion.
            if hyp.parallax_deg < self.config.min_parallax_deg {
                continue;
            }
            match &best {
                Some(b) if hyp.good <= b.good => second_good = second_good.max(hyp.good),
                _ => {
                    if let Some(b) = &best {
                        second_good = b.good;
                    }
                    best = Some(hyp);
                }
            }
        }
        let best = best?;
        debug!(
            "[Initializer] H: {} inliers, best hypothesis {} good (second {}), parallax {:.2}°",
            n_inliers, best.good, second_good, best.parallax_deg
        );

        let accepted = (second_good as f64) < 0.75 * best.good as f64
            && best.parallax_deg >= self.config.min_parallax_deg
            && best.good > self.config.min_triangulated
            && best.good as f64 > 0.9 * n_inliers as f64;
        accepted.then_some(best)
    }

    /// Triangulate the inliers under motion `(r, t)` (camera 1 to camera 2)
    /// and count the points that pass cheirality, reprojection and parallax
    /// checks.
    fn check_rt(
        &self,
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        p1: &[Vector2<f64>],
        p2: &[Vector2<f64>],
        inliers: &[bool],
        k: &Matrix3<f64>,
    ) -> Hypothesis {
        let th2 = 4.0 / self.inv_sigma2;
        let mut proj1 = Matrix3x4::zeros();
        proj1.fixed_view_mut::<3, 3>(0, 0).copy_from(k);
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
        rt.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
        let proj2 = k * rt;
        let center2 = -r.transpose() * t;

        let mut points = vec![None; p1.len()];
        let mut cos_parallax = Vec::new();
        let mut good = 0;
        for i in 0..p1.len() {
            if !inliers[i] {
                continue;
            }
            let Some(x3d) = triangulate(&proj1, &proj2, &p1[i], &p2[i]) else {
                continue;
            };
            let normal1 = x3d;
            let normal2 = x3d - center2;
            let cos = normal1.dot(&normal2) / (normal1.norm() * normal2.norm());

            if x3d.z <= 0.0 && cos < MAX_PARALLAX_COS {
                continue;
            }
            let x3d_c2 = r * x3d + t;
            if x3d_c2.z <= 0.0 && cos < MAX_PARALLAX_COS {
                continue;
            }
            if reprojection_sq(k, &x3d, &p1[i]) > th2 || reprojection_sq(k, &x3d_c2, &p2[i]) > th2 {
                continue;
            }

            cos_parallax.push(cos);
            good += 1;
            if cos < MAX_PARALLAX_COS {
                points[i] = Some(x3d);
            }
        }

        let parallax_deg = if cos_parallax.is_empty() {
            0.0
        } else {
            cos_parallax.sort_by(|a, b| a.total_cmp(b));
            let idx = 50.min(cos_parallax.len() - 1);
            cos_parallax[idx].clamp(-1.0, 1.0).acos().to_degrees()
        };

        Hypothesis {
            good,
            points,
            parallax_deg,
            pose_cw: SE3::from_rt(r, t),
        }
    }
}

fn transfer(h: &Matrix3<f64>, p: &Vector2<f64>) -> Option<Vector2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    (v.z.abs() > f64::EPSILON).then(|| Vector2::new(v.x / v.z, v.y / v.z))
}

fn reprojection_sq(k: &Matrix3<f64>, p: &Vector3<f64>, observed: &Vector2<f64>) -> f64 {
    let inv_z = 1.0 / p.z;
    let u = k[(0, 0)] * p.x * inv_z + k[(0, 2)];
    let v = k[(1, 1)] * p.y * inv_z + k[(1, 2)];
    (u - observed.x).powi(2) + (v - observed.y).powi(2)
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

    fn observe(points: &[Vector3<f64>], pose_cw: &SE3) -> Vec<KeyPoint> {
        let cam = camera();
        points
            .iter()
            .map(|p| {
                let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect()
    }

    fn run(points: &[Vector3<f64>], pose_cw: &SE3) -> Option<TwoViewReconstruction> {
        let reference = observe(points, &SE3::identity());
        let current = observe(points, pose_cw);
        let init = Initializer::new(&reference, &InitializerConfig::default());
        let matches: Vec<Option<usize>> = (0..points.len()).map(Some).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        init.initialize(&current, &matches, &camera(), &mut rng)
    }

    fn assert_same_direction(a: &Vector3<f64>, b: &Vector3<f64>) {
        assert!((a.normalize() - b.normalize()).norm() < 1e-4, "{:?} vs {:?}", a, b);
    }

    #[test]
    fn test_planar_scene_uses_homography() {
        let points: Vec<Vector3<f64>> = (0..10)
            .flat_map(|i| (0..8).map(move |j| Vector3::new(-2.0 + 0.4 * i as f64, -1.5 + 0.4 * j as f64, 5.0)))
            .collect();
        let truth = SE3::from_quaternion(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));

        let rec = run(&points, &truth).expect("planar scene should initialize");
        assert_eq!(rec.model, TwoViewModel::Homography);
        assert!(rec.num_points() >= 72);
        assert_same_direction(&rec.pose_cw.translation, &truth.translation);
        assert!(rec.pose_cw.rotation.angle() < 1e-4);
        for (p, truth) in rec.points.iter().zip(&points) {
            if let Some(p) = p {
                assert_same_direction(p, truth);
            }
        }
    }

    #[test]
    fn test_general_scene_uses_fundamental() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let points: Vec<Vector3<f64>> = (0..100)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(3.0..8.0),
                )
            })
            .collect();
        let truth = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.0, -0.03, 0.01),
            Vector3::new(-0.5, 0.05, 0.1),
        );

        let rec = run(&points, &truth).expect("general scene should initialize");
        assert_eq!(rec.model, TwoViewModel::Fundamental);
        assert!(rec.num_points() >= 90);
        assert_same_direction(&rec.pose_cw.translation, &truth.translation);
        assert!(rec.pose_cw.rotation.angle_to(&truth.rotation) < 1e-4);
    }

    #[test]
    fn test_no_parallax_fails() {
        let points: Vec<Vector3<f64>> = (0..60)
            .map(|i| Vector3::new(-1.5 + 0.05 * i as f64, 0.3 * ((i % 7) as f64 - 3.0), 4.0 + (i % 5) as f64))
            .collect();
        // Pure rotation: no baseline, nothing can be triangulated.
        let truth = SE3::from_quaternion(UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0), Vector3::zeros());
        assert!(run(&points, &truth).is_none());
    }

    #[test]
    fn test_too_few_matches() {
        let points: Vec<Vector3<f64>> = (0..5).map(|i| Vector3::new(i as f64 * 0.1, 0.0, 4.0)).collect();
        let truth = SE3::from_quaternion(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));
        assert!(run(&points, &truth).is_none());
    }
}
