//! Structure-only refinement of a single feature point.
//!
//! Keyframe poses are held fixed; only the 3D position moves. The map
//! maintainer runs this on freshly triangulated points once they have
//! gathered enough observations.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{Dyn, Matrix3, OMatrix, OVector, Owned, Vector2, Vector3, U3};

use crate::geometry::SE3;
use crate::optimizer::pose_optimizer::CHI2_MONO;
use crate::tracking::frame::Camera;

/// A fixed view of the point.
#[derive(Debug, Clone, Copy)]
pub struct PointObservation {
    pub pose_cw: SE3,
    pub uv: Vector2<f64>,
    pub inv_sigma2: f64,
}

struct PointProblem<'a> {
    camera: &'a Camera,
    observations: &'a [PointObservation],
    position: Vector3<f64>,
}

impl LeastSquaresProblem<f64, Dyn, U3> for PointProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, x: &Vector3<f64>) {
        self.position = *x;
    }

    fn params(&self) -> Vector3<f64> {
        self.position
    }

    fn residuals(&self) -> Option<OVector<f64, Dyn>> {
        let mut r = OVector::<f64, Dyn>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let p_c = obs.pose_cw.transform_point(&self.position);
            let proj = self.camera.project(&p_c)?;
            let err = (obs.uv - proj) * obs.inv_sigma2.sqrt();
            r[2 * i] = err.x;
            r[2 * i + 1] = err.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        let mut jac = OMatrix::<f64, Dyn, U3>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let rot: Matrix3<f64> = obs.pose_cw.rotation_matrix();
            let p_c = rot * self.position + obs.pose_cw.translation;
            if p_c.z <= 0.0 {
                return None;
            }
            let inv_z = 1.0 / p_c.z;
            let s = obs.inv_sigma2.sqrt();
            let d_proj = nalgebra::Matrix2x3::new(
                self.camera.fx * inv_z,
                0.0,
                -self.camera.fx * p_c.x * inv_z * inv_z,
                0.0,
                self.camera.fy * inv_z,
                -self.camera.fy * p_c.y * inv_z * inv_z,
            );
            jac.fixed_view_mut::<2, 3>(2 * i, 0)
                .copy_from(&(-d_proj * rot * s));
        }
        Some(jac)
    }
}

/// Refine `initial` against its observations.
///
/// Returns the new position only when every observation ends in front of
/// its camera with a χ² error below the 95% threshold. At least two views
/// are required.
pub fn refine_point(
    initial: &Vector3<f64>,
    observations: &[PointObservation],
    camera: &Camera,
    patience: usize,
) -> Option<Vector3<f64>> {
    if observations.len() < 2 {
        return None;
    }
    let problem = PointProblem {
        camera,
        observations,
        position: *initial,
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(patience)
        .minimize(problem);
    if !report.objective_function.is_finite() {
        return None;
    }
    let refined = problem.position;

    let consistent = observations.iter().all(|obs| {
        let p_c = obs.pose_cw.transform_point(&refined);
        camera
            .project(&p_c)
            .map(|proj| (obs.uv - proj).norm_squared() * obs.inv_sigma2 <= CHI2_MONO)
            .unwrap_or(false)
    });
    consistent.then_some(refined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::pose_optimizer::tests::camera;
    use nalgebra::UnitQuaternion;

    fn views(point: &Vector3<f64>) -> Vec<PointObservation> {
        let cam = camera();
        [-0.4, 0.0, 0.4]
            .iter()
            .map(|&x| {
                let pose_cw = SE3::from_quaternion(
                    UnitQuaternion::from_euler_angles(0.0, x * 0.1, 0.0),
                    Vector3::new(x, 0.0, 0.0),
                );
                let uv = cam.project(&pose_cw.transform_point(point)).unwrap();
                PointObservation {
                    pose_cw,
                    uv,
                    inv_sigma2: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_recovers_point() {
        let truth = Vector3::new(0.3, -0.2, 4.0);
        let obs = views(&truth);
        let refined = refine_point(&(truth + Vector3::new(0.05, 0.04, -0.2)), &obs, &camera(), 20).unwrap();
        assert!((refined - truth).norm() < 1e-6);
    }

    #[test]
    fn test_rejects_inconsistent_views() {
        let truth = Vector3::new(0.3, -0.2, 4.0);
        let mut obs = views(&truth);
        obs[2].uv += Vector2::new(80.0, 0.0);
        assert!(refine_point(&truth, &obs, &camera(), 20).is_none());
    }

    #[test]
    fn test_needs_two_views() {
        let truth = Vector3::new(0.0, 0.0, 3.0);
        let obs = views(&truth);
        assert!(refine_point(&truth, &obs[..1], &camera(), 20).is_none());
    }
}
