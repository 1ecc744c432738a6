//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - pose estimate and the keyframe used as reference
//! - correspondence counts
//! - timing information for profiling

use crate::geometry::SE3;
use crate::map::KeyframeId;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: u64,
    pub timestamp: f64,
    /// State before this frame.
    pub previous_state: TrackingState,
    pub state: TrackingState,
    /// Camera-to-world pose. Only set when `state` is `Ok`.
    pub pose: Option<SE3>,
    pub reference_keyframe: Option<KeyframeId>,
    /// Keyframe inserted for this frame, including the second keyframe of
    /// map initialization.
    pub keyframe_created: Option<KeyframeId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

impl TrackingResult {
    pub fn state_changed(&self) -> bool {
        self.previous_state != self.state
    }
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub num_features: usize,
    /// Feature point matches before the final outlier rejection.
    pub num_matches: usize,
    pub num_inliers: usize,
    /// Points triangulated together with a new keyframe.
    pub new_points: usize,
}

/// Timing breakdown for a frame, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub track_ms: f64,
    pub keyframe_ms: f64,
}
