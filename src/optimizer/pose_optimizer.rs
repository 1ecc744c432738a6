//! Motion-only pose optimization using Levenberg-Marquardt.
//!
//! Minimizes the reprojection error of fixed 3D points over the camera pose
//!
//! ```text
//! E(ω, t) = Σ_i ρ(‖u_i - π(exp(ω) R₀ p_i + t)‖²_Σi)
//! ```
//!
//! with the rotation parameterized as a left perturbation `exp(ω)` of the
//! current estimate `R₀`. Four rounds are run; after each round every
//! observation is classified as inlier or outlier by its χ² error and only
//! inliers take part in the next round. The Huber kernel is dropped for the
//! last two rounds.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{
    Dyn, Matrix2x3, Matrix2x6, Matrix3, OMatrix, OVector, Owned, UnitQuaternion, Vector2, Vector3,
    Vector6, U6,
};
use tracing::debug;

use crate::geometry::so3::{left_jacobian_so3, skew};
use crate::geometry::SE3;
use crate::map::Map;
use crate::tracking::frame::Camera;
use crate::tracking::tracking_frame::Frame;

/// χ² threshold with 2 degrees of freedom at 95%.
pub const CHI2_MONO: f64 = 5.991;
const ROUNDS: usize = 4;
const LM_PATIENCE: usize = 10;

/// One 2D-3D correspondence.
#[derive(Debug, Clone, Copy)]
pub struct PoseObservation {
    /// Point in world coordinates.
    pub point: Vector3<f64>,
    /// Observed undistorted pixel.
    pub uv: Vector2<f64>,
    /// Inverse variance of the keypoint's pyramid level.
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct PoseOptimizationResult {
    /// Optimized world-to-camera pose.
    pub pose_cw: SE3,
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Residual `obs - π(p_c)` and its Jacobian w.r.t. the camera-frame point.
/// `None` for points at or behind the camera.
fn projection_error(camera: &Camera, p_c: &Vector3<f64>, uv: &Vector2<f64>) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
    let proj = camera.project(p_c)?;
    let inv_z = 1.0 / p_c.z;
    let inv_z2 = inv_z * inv_z;
    let d_proj = Matrix2x3::new(
        camera.fx * inv_z,
        0.0,
        -camera.fx * p_c.x * inv_z2,
        0.0,
        camera.fy * inv_z,
        -camera.fy * p_c.y * inv_z2,
    );
    Some((uv - proj, -d_proj))
}

fn huber_weight(chi2: f64, robust: bool) -> f64 {
    let delta = CHI2_MONO.sqrt();
    let e = chi2.sqrt();
    if !robust || e <= delta {
        1.0
    } else {
        delta / e
    }
}

/// Error of a point that projects behind the camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e3;

struct PoseProblem<'a> {
    camera: &'a Camera,
    observations: Vec<&'a PoseObservation>,
    base_rotation: UnitQuaternion<f64>,
    omega: Vector3<f64>,
    translation: Vector3<f64>,
    /// Robust weights, frozen at the linearization point of each round.
    weights: Vec<f64>,
}

impl<'a> PoseProblem<'a> {
    fn new(
        camera: &'a Camera,
        observations: Vec<&'a PoseObservation>,
        pose_cw: &SE3,
        robust: bool,
    ) -> Self {
        let mut problem = Self {
            camera,
            observations,
            base_rotation: pose_cw.rotation,
            omega: Vector3::zeros(),
            translation: pose_cw.translation,
            weights: Vec::new(),
        };
        problem.weights = problem
            .observations
            .iter()
            .map(|obs| {
                let chi2 = problem.chi2(obs).unwrap_or(f64::INFINITY);
                huber_weight(chi2, robust)
            })
            .collect();
        problem
    }

    fn rotation(&self) -> UnitQuaternion<f64> {
        crate::geometry::so3::exp(&self.omega) * self.base_rotation
    }

    fn pose_cw(&self) -> SE3 {
        SE3::from_quaternion(self.rotation(), self.translation)
    }

    fn chi2(&self, obs: &PoseObservation) -> Option<f64> {
        let p_c = self.rotation() * obs.point + self.translation;
        let (err, _) = projection_error(self.camera, &p_c, &obs.uv)?;
        Some(err.norm_squared() * obs.inv_sigma2)
    }
}

impl LeastSquaresProblem<f64, Dyn, U6> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.omega = Vector3::new(x[0], x[1], x[2]);
        self.translation = Vector3::new(x[3], x[4], x[5]);
    }

    fn params(&self) -> Vector6<f64> {
        Vector6::new(
            self.omega.x,
            self.omega.y,
            self.omega.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    fn residuals(&self) -> Option<OVector<f64, Dyn>> {
        let rotation = self.rotation();
        let mut r = OVector::<f64, Dyn>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let scale = (self.weights[i] * obs.inv_sigma2).sqrt();
            let p_c = rotation * obs.point + self.translation;
            let err = match projection_error(self.camera, &p_c, &obs.uv) {
                Some((err, _)) => err,
                None => Vector2::repeat(BEHIND_CAMERA_RESIDUAL),
            };
            r[2 * i] = scale * err.x;
            r[2 * i + 1] = scale * err.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let rotation = self.rotation();
        let jl: Matrix3<f64> = left_jacobian_so3(&self.omega);
        let mut jac = OMatrix::<f64, Dyn, U6>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let rotated = rotation * obs.point;
            let p_c = rotated + self.translation;
            let Some((_, d_err)) = projection_error(self.camera, &p_c, &obs.uv) else {
                continue;
            };
            let scale = (self.weights[i] * obs.inv_sigma2).sqrt();
            let mut d_pc = Matrix2x6::zeros();
            d_pc.fixed_view_mut::<2, 3>(0, 0)
                .copy_from(&(d_err * (-skew(&rotated) * jl)));
            d_pc.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_err);
            jac.fixed_view_mut::<2, 6>(2 * i, 0).copy_from(&(d_pc * scale));
        }
        Some(jac)
    }
}

/// Refine `initial_cw` against `observations`, rejecting outliers.
///
/// Returns `None` when fewer than three observations are given.
pub fn optimize_pose(
    initial_cw: &SE3,
    observations: &[PoseObservation],
    camera: &Camera,
) -> Option<PoseOptimizationResult> {
    if observations.len() < 3 {
        return None;
    }
    let mut pose_cw = *initial_cw;
    let mut outliers = vec![false; observations.len()];
    let mut num_bad = 0;

    for round in 0..ROUNDS {
        let active: Vec<&PoseObservation> = observations
            .iter()
            .zip(&outliers)
            .filter(|(_, &out)| !out)
            .map(|(obs, _)| obs)
            .collect();
        if active.len() < 3 {
            break;
        }

        let problem = PoseProblem::new(camera, active, &pose_cw, round < 2);
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(LM_PATIENCE)
            .minimize(problem);
        if report.objective_function.is_finite() {
            pose_cw = problem.pose_cw();
        }

        // Re-classify every observation, including earlier outliers.
        let probe = PoseProblem::new(camera, Vec::new(), &pose_cw, false);
        num_bad = 0;
        for (obs, out) in observations.iter().zip(outliers.iter_mut()) {
            let chi2 = probe.chi2(obs).unwrap_or(f64::INFINITY);
            *out = chi2 > CHI2_MONO;
            if *out {
                num_bad += 1;
            }
        }

        debug!(
            "[PoseOpt] round {}: {} inliers / {} ({:?})",
            round,
            observations.len() - num_bad,
            observations.len(),
            report.termination
        );
        if observations.len() - num_bad < 10 {
            break;
        }
    }

    Some(PoseOptimizationResult {
        pose_cw,
        num_inliers: observations.len() - num_bad,
        outliers,
    })
}

/// Optimize the pose of `frame` from its current feature point matches.
///
/// The frame's outlier flags are updated and its pose replaced. Returns the
/// number of inliers, or 0 when the frame has no pose or too few matches.
pub fn optimize_frame_pose(frame: &mut Frame, map: &Map, camera: &Camera) -> usize {
    let Some(initial_cw) = frame.pose_cw() else {
        return 0;
    };
    let pyramid = map.pyramid();
    let mut indices = Vec::new();
    let mut observations = Vec::new();
    for (idx, fp) in frame.feature_points.iter().enumerate() {
        let Some(point) = fp.and_then(|id| map.good_feature_point(id)) else {
            continue;
        };
        let kp = &frame.keypoints[idx];
        indices.push(idx);
        observations.push(PoseObservation {
            point: point.position,
            uv: kp.pt,
            inv_sigma2: 1.0 / pyramid.sigma2(kp.octave),
        });
    }

    let Some(result) = optimize_pose(&initial_cw, &observations, camera) else {
        return 0;
    };
    frame.set_pose(result.pose_cw.inverse());
    for (&idx, &out) in indices.iter().zip(&result.outliers) {
        frame.outliers[idx] = out;
    }
    result.num_inliers
}
