//! Keyframe decision criteria.

use crate::config::TrackingConfig;

/// Inlier count a frame must exceed to become a keyframe.
const MIN_KEYFRAME_INLIERS: usize = 15;

/// What the tracker knows about the current frame when deciding.
#[derive(Debug, Clone, Copy)]
pub struct KeyframeCandidate {
    pub frame_id: u64,
    pub last_keyframe_frame_id: u64,
    pub last_relocalization_frame_id: u64,
    pub keyframes_in_map: usize,
    /// Local-map inliers of the current frame.
    pub tracked_inliers: usize,
    /// Points of the reference keyframe observed by enough keyframes.
    pub reference_tracked_points: usize,
    /// Whether the map maintainer has no pending work.
    pub maintainer_idle: bool,
    /// Camera translation since the last keyframe (map units).
    pub translation_since_keyframe: f64,
    /// Camera rotation since the last keyframe (degrees).
    pub rotation_since_keyframe_deg: f64,
}

/// Decides whether the current frame should become a keyframe.
///
/// A keyframe is inserted when enough frames passed (`max_frames`, or
/// `min_frames` with an idle maintainer), the frame tracks clearly fewer
/// points than the reference keyframe while still tracking more than a
/// handful, and the camera actually moved.
#[derive(Debug, Clone)]
pub struct KeyframeDecision {
    min_frames: u64,
    max_frames: u64,
    tracked_ratio: f64,
    min_translation: f64,
    min_rotation_deg: f64,
}

impl KeyframeDecision {
    /// `fps_frames` is used when the configuration leaves `max_frames` at 0.
    pub fn new(config: &TrackingConfig, fps_frames: u32) -> Self {
        let max_frames = if config.max_frames == 0 {
            fps_frames
        } else {
            config.max_frames
        };
        Self {
            min_frames: config.min_frames as u64,
            max_frames: max_frames.max(1) as u64,
            tracked_ratio: config.keyframe_tracked_ratio,
            min_translation: config.min_keyframe_translation,
            min_rotation_deg: config.min_keyframe_rotation_deg,
        }
    }

    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    /// Minimum observers for a reference point to count as well tracked.
    pub fn min_observations(keyframes_in_map: usize) -> usize {
        if keyframes_in_map <= 2 {
            2
        } else {
            3
        }
    }

    pub fn should_create(&self, c: &KeyframeCandidate) -> bool {
        // Right after relocalization the map is not trusted yet.
        let since_reloc = c.frame_id.saturating_sub(c.last_relocalization_frame_id);
        if since_reloc < self.max_frames && c.keyframes_in_map as u64 > self.max_frames {
            return false;
        }

        let ratio = if c.keyframes_in_map < 2 {
            0.4
        } else {
            self.tracked_ratio
        };
        let since_kf = c.frame_id.saturating_sub(c.last_keyframe_frame_id);

        let timeout = since_kf >= self.max_frames;
        let idle_window = since_kf >= self.min_frames && c.maintainer_idle;
        let weak_tracking = (c.tracked_inliers as f64) < c.reference_tracked_points as f64 * ratio
            && c.tracked_inliers > MIN_KEYFRAME_INLIERS;
        let moved = c.translation_since_keyframe >= self.min_translation
            || c.rotation_since_keyframe_deg >= self.min_rotation_deg;

        (timeout || idle_window) && weak_tracking && moved && c.maintainer_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> KeyframeCandidate {
        KeyframeCandidate {
            frame_id: 40,
            last_keyframe_frame_id: 35,
            last_relocalization_frame_id: 0,
            keyframes_in_map: 5,
            tracked_inliers: 60,
            reference_tracked_points: 100,
            maintainer_idle: true,
            translation_since_keyframe: 0.2,
            rotation_since_keyframe_deg: 0.0,
        }
    }

    fn decision() -> KeyframeDecision {
        KeyframeDecision::new(&TrackingConfig::default(), 30)
    }

    #[test]
    fn test_weak_tracking_with_idle_maintainer() {
        assert!(decision().should_create(&candidate()));
    }

    #[test]
    fn test_strong_tracking_needs_no_keyframe() {
        let c = KeyframeCandidate {
            tracked_inliers: 95,
            ..candidate()
        };
        assert!(!decision().should_create(&c));
    }

    #[test]
    fn test_too_few_inliers() {
        let c = KeyframeCandidate {
            tracked_inliers: 15,
            ..candidate()
        };
        assert!(!decision().should_create(&c));
    }

    #[test]
    fn test_busy_maintainer_blocks() {
        let c = KeyframeCandidate {
            maintainer_idle: false,
            frame_id: 100,
            ..candidate()
        };
        assert!(!decision().should_create(&c));
    }

    #[test]
    fn test_motion_gate() {
        let still = KeyframeCandidate {
            translation_since_keyframe: 0.001,
            rotation_since_keyframe_deg: 0.5,
            ..candidate()
        };
        assert!(!decision().should_create(&still));
        let turned = KeyframeCandidate {
            rotation_since_keyframe_deg: 3.0,
            ..still
        };
        assert!(decision().should_create(&turned));
    }

    #[test]
    fn test_recent_relocalization_blocks() {
        let c = KeyframeCandidate {
            last_relocalization_frame_id: 30,
            keyframes_in_map: 40,
            ..candidate()
        };
        assert!(!decision().should_create(&c));
    }

    #[test]
    fn test_max_frames_defaults_to_fps() {
        assert_eq!(decision().max_frames(), 30);
        let config = TrackingConfig {
            max_frames: 10,
            ..TrackingConfig::default()
        };
        assert_eq!(KeyframeDecision::new(&config, 30).max_frames(), 10);
    }
}
