//! Nonlinear least-squares refinement.
//!
//! - Motion-only pose optimization (for tracking)
//! - Structure-only point refinement (for map maintenance)

pub mod point_refiner;
pub mod pose_optimizer;

pub use point_refiner::{refine_point, PointObservation};
pub use pose_optimizer::{optimize_frame_pose, optimize_pose, PoseObservation, PoseOptimizationResult, CHI2_MONO};
