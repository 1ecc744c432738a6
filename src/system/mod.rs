//! Engine orchestration and thread management.
//!
//! This module contains the top-level `Engine` that owns a session's map,
//! drives the tracker and runs the map maintainer thread, along with shared
//! state, the pose history and inter-thread messaging types.

mod engine;
pub mod messages;
pub mod pose_history;
pub mod shared_state;

pub use engine::{Engine, FeaturePointView};
pub use messages::{NewKeyframeMsg, TimedImage};
pub use pose_history::{PoseHistory, StampedPose};
pub use shared_state::SharedState;
