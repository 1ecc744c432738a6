//! Constant-velocity motion model for pose prediction.

use crate::geometry::SE3;

/// Predicts the next camera pose by repeating the relative motion observed
/// between the two previous frames.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Last camera-to-world pose.
    prev_pose: Option<SE3>,
    /// Relative motion `T_prev⁻¹ · T_curr` between the last two poses.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pose of a successfully tracked frame.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = self.prev_pose {
            self.velocity = Some(prev.inverse().compose(pose));
        }
        self.prev_pose = Some(*pose);
    }

    /// Whether two consecutive poses have been observed.
    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Predicted camera-to-world pose of the next frame.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose?;
        Some(match self.velocity {
            Some(v) => prev.compose(&v),
            None => prev,
        })
    }

    /// Forget the velocity but keep the last pose, used after the pose chain
    /// is broken (relocalization).
    pub fn restart_from(&mut self, pose: &SE3) {
        self.prev_pose = Some(*pose);
        self.velocity = None;
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}
