//! Monocular visual SLAM: tracking, map initialization, relocalization and
//! map maintenance over a sparse map of ORB feature points.
//!
//! [`Engine`] is the entry point: feed it images with [`Engine::track`] and
//! read back the tracking state, pose history and feature points.

pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod map;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::{Settings, SlamConfig};
pub use error::{Result, SlamError};
pub use system::{Engine, FeaturePointView, StampedPose};
pub use tracking::TrackingState;
