//! Map data structures: keyframes, feature points and the map that owns
//! them, plus the keyframe database used for relocalization.

pub mod feature_point;
pub mod keyframe;
pub mod keyframe_db;
#[allow(clippy::module_inception)]
pub mod map;
pub mod types;

pub use feature_point::FeaturePoint;
pub use keyframe::Keyframe;
pub use keyframe_db::KeyframeDatabase;
pub use map::{CullPolicy, CullReport, LocalKeyframes, Map};
pub use types::{FeaturePointId, KeyframeId};
