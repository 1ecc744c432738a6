//! Channel payloads.

use image::DynamicImage;

use crate::map::{FeaturePointId, KeyframeId};

/// Sent from the tracker to the maintainer after a keyframe is committed to
/// the map.
#[derive(Debug, Clone)]
pub struct NewKeyframeMsg {
    pub keyframe_id: KeyframeId,
    /// Points triangulated together with the keyframe. They are watched by
    /// recent-point culling until they mature.
    pub new_points: Vec<FeaturePointId>,
}

/// One input image for [`Engine::run`](crate::system::Engine::run).
pub struct TimedImage {
    pub image: DynamicImage,
    /// Seconds.
    pub timestamp: f64,
}
