//! Append-only record of tracked camera poses.

use nalgebra::{Matrix4, Vector3};

use crate::error::{checked_index, Result};
use crate::geometry::SE3;

/// Pose of one successfully tracked frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedPose {
    /// Seconds.
    pub timestamp: f64,
    pub world_to_camera: SE3,
}

impl StampedPose {
    pub fn new(timestamp: f64, world_to_camera: SE3) -> Self {
        Self {
            timestamp,
            world_to_camera,
        }
    }

    /// Camera center in world coordinates, `-Rᵀt`.
    pub fn position(&self) -> Vector3<f64> {
        let r = self.world_to_camera.rotation_matrix();
        -(r.transpose() * self.world_to_camera.translation)
    }

    pub fn camera_to_world(&self) -> SE3 {
        self.world_to_camera.inverse()
    }

    /// Homogeneous world-to-camera transform.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.world_to_camera.to_matrix()
    }
}

/// Poses in tracking order, one per frame that ended in `Ok`.
#[derive(Debug, Default)]
pub struct PoseHistory {
    poses: Vec<StampedPose>,
    changed: bool,
}

impl PoseHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pose: StampedPose) {
        self.poses.push(pose);
        self.changed = true;
    }

    pub fn get(&self, index: usize) -> Result<&StampedPose> {
        checked_index(&self.poses, index)
    }

    pub fn last(&self) -> Option<&StampedPose> {
        self.poses.last()
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StampedPose> {
        self.poses.iter()
    }

    /// Whether a pose was appended since the previous call. Reading clears
    /// the flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlamError;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_position_is_camera_center() {
        let pose_wc = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.2),
            Vector3::new(1.0, 2.0, -0.5),
        );
        let stamped = StampedPose::new(0.0, pose_wc.inverse());
        assert_relative_eq!(stamped.position(), pose_wc.translation, epsilon = 1e-12);
        assert_relative_eq!(stamped.camera_to_world().translation, pose_wc.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_changed_flag_reads_once() {
        let mut history = PoseHistory::new();
        assert!(!history.take_changed());
        history.push(StampedPose::new(0.0, SE3::identity()));
        assert!(history.take_changed());
        assert!(!history.take_changed());
        history.push(StampedPose::new(1.0, SE3::identity()));
        history.push(StampedPose::new(2.0, SE3::identity()));
        assert!(history.take_changed());
        assert!(!history.take_changed());
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_out_of_range() {
        let mut history = PoseHistory::new();
        history.push(StampedPose::new(0.5, SE3::identity()));
        assert_eq!(history.get(0).unwrap().timestamp, 0.5);
        assert!(matches!(
            history.get(1),
            Err(SlamError::OutOfRange { index: 1, len: 1 })
        ));
    }
}
