//! Frame-level processing: camera model, ORB feature detection and the
//! scale pyramid shared by every component that reasons about octaves.

pub mod camera;
pub mod features;
#[cfg(feature = "opencv")]
pub mod opencv_orb;
pub mod orb;

pub use camera::Camera;
pub use features::{
    descriptor_distance, Descriptor, FeatureExtractor, FeatureSet, KeyPoint, ScalePyramid,
    NN_RATIO, TH_HIGH, TH_LOW,
};
#[cfg(feature = "opencv")]
pub use opencv_orb::OpenCvOrbExtractor;
pub use orb::OrbExtractor;
