//! Keypoints, binary descriptors and the extractor seam.

use image::GrayImage;
use nalgebra::Vector2;

/// ORB matching thresholds.
pub const TH_HIGH: u32 = 100;
pub const TH_LOW: u32 = 50;
pub const NN_RATIO: f64 = 0.75;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// A detected keypoint in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Vector2<f64>,
    /// Pyramid level the keypoint was detected at.
    pub octave: usize,
    /// Orientation in degrees, `[0, 360)`.
    pub angle: f64,
    pub response: f64,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: usize) -> Self {
        Self {
            pt: Vector2::new(x, y),
            octave,
            angle: 0.0,
            response: 0.0,
        }
    }
}

/// Features extracted from one image.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Produces keypoints and descriptors from a grayscale image.
///
/// Keypoints are returned in raw (distorted) pixel coordinates; the frame
/// undistorts them.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> anyhow::Result<FeatureSet>;
}

/// Number of differing bits between two descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Per-level scale factors and keypoint variances of the image pyramid.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        let num_levels = num_levels.max(1);
        let scale_factors: Vec<f64> = (0..num_levels)
            .map(|i| scale_factor.powi(i as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        Self {
            scale_factor,
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s| 1.0 / s).collect(),
            scale_factors,
            level_sigma2,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.scale_factors.len()
    }

    pub fn log_scale_factor(&self) -> f64 {
        self.scale_factor.ln()
    }

    /// Level at which a point with the given scale-invariance range is
    /// expected to be detected from `distance`.
    pub fn predict_level(&self, distance: f64, max_distance: f64) -> usize {
        if distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.log_scale_factor()).ceil();
        level.clamp(0.0, (self.num_levels() - 1) as f64) as usize
    }

    pub fn sigma2(&self, octave: usize) -> f64 {
        self.level_sigma2[octave.min(self.num_levels() - 1)]
    }

    pub fn scale(&self, octave: usize) -> f64 {
        self.scale_factors[octave.min(self.num_levels() - 1)]
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(descriptor_distance(&a, &b), 11);
    }

    #[test]
    fn test_scale_pyramid() {
        let pyramid = ScalePyramid::new(1.2, 8);
        assert_eq!(pyramid.num_levels(), 8);
        assert_relative_eq!(pyramid.scale(2), 1.44, epsilon = 1e-12);
        assert_relative_eq!(pyramid.sigma2(1), 1.44, epsilon = 1e-12);
        assert_relative_eq!(pyramid.inv_scale_factors[1], 1.0 / 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_level() {
        let pyramid = ScalePyramid::new(1.2, 8);
        // Observed at the far end of its range: finest level.
        assert_eq!(pyramid.predict_level(10.0, 10.0), 0);
        // Observed from much closer: clamped to the coarsest level.
        assert_eq!(pyramid.predict_level(0.1, 10.0), 7);
        assert_eq!(pyramid.predict_level(10.0 / 1.3, 10.0), 2);
    }
}
