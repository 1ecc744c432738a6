//! Tracking: turns each image into a camera pose.
//!
//! - Frame processing (ORB extraction, undistortion, BoW)
//! - Two-view map initialization
//! - Pose estimation (motion model, reference keyframe, local map)
//! - Relocalization after tracking loss
//! - New keyframe decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod matching;
pub mod motion_model;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;

pub use result::TrackingResult;
pub use state::TrackingState;
pub use tracker::Tracker;
