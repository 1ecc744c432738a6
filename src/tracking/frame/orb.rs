//! Built-in ORB extractor: FAST corners on a scale pyramid, intensity
//! centroid orientation and steered BRIEF descriptors.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::features::{Descriptor, FeatureExtractor, FeatureSet, KeyPoint};
use crate::config::OrbParams;

/// Keypoints closer than this to the border of their level are discarded.
const EDGE_THRESHOLD: u32 = 19;
const HALF_PATCH_SIZE: i32 = 15;
/// BRIEF sampling pairs lie within this radius of the keypoint.
const PATTERN_RADIUS: i32 = 13;
const CELL_SIZE: u32 = 30;
const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// ORB feature extractor.
pub struct OrbExtractor {
    params: OrbParams,
    features_per_level: Vec<usize>,
    /// Horizontal extent of the orientation patch for each row offset.
    umax: Vec<i32>,
    /// 256 point pairs `(x1, y1, x2, y2)`.
    pattern: Vec<[i32; 4]>,
}

impl OrbExtractor {
    pub fn new(params: OrbParams) -> Self {
        let n_levels = params.num_levels.max(1);
        let inv_scale = 1.0 / params.scale_factor;

        // Geometric distribution of the feature budget over the pyramid.
        let mut per_level = Vec::with_capacity(n_levels);
        let mut desired = params.num_features as f64 * (1.0 - inv_scale)
            / (1.0 - inv_scale.powi(n_levels as i32));
        let mut total = 0;
        for _ in 0..n_levels.saturating_sub(1) {
            let n = desired.round() as usize;
            per_level.push(n);
            total += n;
            desired *= inv_scale;
        }
        per_level.push(params.num_features.saturating_sub(total));

        let umax = (0..=HALF_PATCH_SIZE)
            .map(|v| ((HALF_PATCH_SIZE * HALF_PATCH_SIZE - v * v) as f64).sqrt().round() as i32)
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(PATTERN_SEED);
        let pattern = (0..256)
            .map(|_| {
                [
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                ]
            })
            .collect();

        Self {
            params,
            features_per_level: per_level,
            umax,
            pattern,
        }
    }

    fn build_pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut levels = Vec::with_capacity(self.params.num_levels);
        levels.push(image.clone());
        for level in 1..self.params.num_levels {
            let scale = self.params.scale_factor.powi(level as i32);
            let w = (image.width() as f64 / scale).round() as u32;
            let h = (image.height() as f64 / scale).round() as u32;
            if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD {
                break;
            }
            levels.push(imageops::resize(image, w, h, FilterType::Triangle));
        }
        levels
    }

    /// FAST corners away from the border, retried with the lower threshold
    /// when the initial one is too strict.
    fn detect(&self, img: &GrayImage, wanted: usize) -> Vec<Corner> {
        let (w, h) = img.dimensions();
        let inside = |c: &Corner| {
            c.x >= EDGE_THRESHOLD
                && c.y >= EDGE_THRESHOLD
                && c.x < w - EDGE_THRESHOLD
                && c.y < h - EDGE_THRESHOLD
        };
        let mut corners: Vec<Corner> = corners_fast9(img, self.params.ini_th_fast)
            .into_iter()
            .filter(inside)
            .collect();
        if corners.len() < wanted {
            corners = corners_fast9(img, self.params.min_th_fast)
                .into_iter()
                .filter(inside)
                .collect();
        }
        corners
    }

    /// Keep the strongest corners while spreading them over the image: the
    /// best corner of every cell first, then the remaining ones by score.
    fn distribute(mut corners: Vec<Corner>, wanted: usize, width: u32) -> Vec<Corner> {
        corners.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if corners.len() <= wanted {
            return corners;
        }
        let cols = (width / CELL_SIZE + 1) as usize;
        let mut taken_cells = std::collections::HashSet::new();
        let (mut first, mut rest): (Vec<Corner>, Vec<Corner>) = (Vec::new(), Vec::new());
        for c in corners {
            let cell = (c.y / CELL_SIZE) as usize * cols + (c.x / CELL_SIZE) as usize;
            if taken_cells.insert(cell) {
                first.push(c);
            } else {
                rest.push(c);
            }
        }
        first.truncate(wanted);
        let remaining = wanted - first.len();
        first.extend(rest.into_iter().take(remaining));
        first
    }

    fn orientation(&self, img: &GrayImage, x: i32, y: i32) -> f64 {
        let px = |u: i32, v: i32| img.get_pixel((x + u) as u32, (y + v) as u32)[0] as f64;
        let mut m01 = 0.0;
        let mut m10 = 0.0;
        for u in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
            m10 += u as f64 * px(u, 0);
        }
        for v in 1..=HALF_PATCH_SIZE {
            let d = self.umax[v as usize];
            for u in -d..=d {
                let (top, bottom) = (px(u, -v), px(u, v));
                m10 += u as f64 * (top + bottom);
                m01 += v as f64 * (bottom - top);
            }
        }
        let angle = m01.atan2(m10).to_degrees();
        if angle < 0.0 {
            angle + 360.0
        } else {
            angle
        }
    }

    fn describe(&self, blurred: &GrayImage, x: i32, y: i32, angle_deg: f64) -> Descriptor {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let sample = |px: i32, py: i32| {
            let rx = (px as f64 * cos - py as f64 * sin).round() as i32;
            let ry = (px as f64 * sin + py as f64 * cos).round() as i32;
            blurred.get_pixel((x + rx) as u32, (y + ry) as u32)[0]
        };
        let mut desc = [0u8; 32];
        for (i, p) in self.pattern.iter().enumerate() {
            if sample(p[0], p[1]) < sample(p[2], p[3]) {
                desc[i / 8] |= 1 << (i % 8);
            }
        }
        desc
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&mut self, image: &GrayImage) -> anyhow::Result<FeatureSet> {
        let mut features = FeatureSet::default();
        for (level, img) in self.build_pyramid(image).iter().enumerate() {
            let wanted = self.features_per_level[level];
            let corners = Self::distribute(self.detect(img, wanted), wanted, img.width());
            if corners.is_empty() {
                continue;
            }
            let blurred = gaussian_blur_f32(img, 2.0);
            let scale = self.params.scale_factor.powi(level as i32);

            for c in corners {
                let (x, y) = (c.x as i32, c.y as i32);
                let angle = self.orientation(img, x, y);
                features.descriptors.push(self.describe(&blurred, x, y, angle));
                features.keypoints.push(KeyPoint {
                    pt: nalgebra::Vector2::new(c.x as f64 * scale, c.y as f64 * scale),
                    octave: level,
                    angle,
                    response: c.score as f64,
                });
            }
        }
        debug!("[ORB] Extracted {} keypoints", features.len());
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Bright isolated squares on a dark background.
    fn squares(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            if x % 40 >= 12 && x % 40 < 28 && y % 40 >= 12 && y % 40 < 28 {
                Luma([230u8])
            } else {
                Luma([20u8])
            }
        })
    }

    #[test]
    fn test_feature_budget_sums_to_total() {
        let extractor = OrbExtractor::new(OrbParams::default());
        let total: usize = extractor.features_per_level.iter().sum();
        assert_eq!(total, 1000);
        assert!(extractor.features_per_level[0] > extractor.features_per_level[7]);
    }

    #[test]
    fn test_blank_image_has_no_features() {
        let mut extractor = OrbExtractor::new(OrbParams::default());
        let img = GrayImage::from_pixel(320, 240, Luma([128u8]));
        assert!(extractor.extract(&img).unwrap().is_empty());
    }

    #[test]
    fn test_keypoints_inside_image_with_descriptors() {
        let mut extractor = OrbExtractor::new(OrbParams {
            num_features: 200,
            ..OrbParams::default()
        });
        let img = squares(320, 240);
        let features = extractor.extract(&img).unwrap();

        assert!(!features.is_empty());
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        assert!(features.len() <= 200);
        for kp in &features.keypoints {
            assert!(kp.pt.x >= 0.0 && kp.pt.x < 320.0);
            assert!(kp.pt.y >= 0.0 && kp.pt.y < 240.0);
            assert!(kp.angle >= 0.0 && kp.angle < 360.0);
        }
    }
}
