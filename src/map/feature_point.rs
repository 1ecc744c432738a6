//! FeaturePoint - a 3D landmark observed by keyframes.
//!
//! Each point records which keyframes observe it, quality counters used for
//! culling, and the viewing geometry (mean normal and scale-invariance
//! distance range) used to decide whether a frame can see it.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::{descriptor_distance, Descriptor, ScalePyramid};

use super::types::{FeaturePointId, KeyframeId};

/// A landmark in world coordinates.
#[derive(Clone)]
pub struct FeaturePoint {
    pub id: FeaturePointId,

    /// Position in the world frame.
    pub position: Vector3<f64>,

    /// Timestamp (seconds) of the frame that created this point.
    pub timestamp: f64,

    /// Representative descriptor: the observation descriptor with the least
    /// median distance to all the others.
    pub descriptor: Descriptor,

    /// observations[kf] = index of the keypoint in that keyframe.
    pub observations: HashMap<KeyframeId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance range.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point fell inside a tracked frame's frustum.
    pub visible_count: u32,

    /// Times the point was matched in a tracked frame.
    pub found_count: u32,

    /// Keyframe that created this point.
    pub origin: KeyframeId,

    /// Whether the most recently tracked frame matched this point as an inlier.
    pub matched_in_last_frame: bool,

    pub is_bad: bool,
}

impl FeaturePoint {
    pub fn new(
        id: FeaturePointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        origin: KeyframeId,
        timestamp: f64,
    ) -> Self {
        Self {
            id,
            position,
            timestamp,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            origin,
            matched_in_last_frame: false,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyframeId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyframeId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyframeId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// found / visible. Points never seen in a frustum are not penalized.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Whether `distance` lies inside the scale-invariance range, with the
    /// tolerance used by the frustum test.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Pyramid level at which the point should appear from `distance`.
    pub fn predict_level(&self, distance: f64, pyramid: &ScalePyramid) -> usize {
        pyramid.predict_level(distance, self.max_distance)
    }

    /// Recompute the mean viewing normal from the observer camera centers and
    /// the distance range from the reference observation.
    ///
    /// `reference` is the camera center of the origin keyframe and the
    /// octave the point was detected at there.
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        reference: (Vector3<f64>, usize),
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let (ref_center, octave) = reference;
        let dist = (self.position - ref_center).norm();
        let max_level = pyramid.num_levels() - 1;
        self.max_distance = dist * pyramid.scale(octave);
        self.min_distance = self.max_distance / pyramid.scale(max_level);
    }

    /// Pick the descriptor with the least median distance to the others.
    pub fn update_descriptor(&mut self, descriptors: &[Descriptor]) {
        if let Some(best) = distinctive_descriptor(descriptors) {
            self.descriptor = best;
        }
    }
}

/// The element of `descriptors` whose median Hamming distance to the rest is
/// smallest.
pub fn distinctive_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
    let n = descriptors.len();
    if n == 0 {
        return None;
    }
    let mut best_median = u32::MAX;
    let mut best_idx = 0;
    for i in 0..n {
        let mut dists: Vec<u32> = (0..n)
            .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
            .collect();
        dists.sort_unstable();
        let median = dists[(n - 1) / 2];
        if median < best_median {
            best_median = median;
            best_idx = i;
        }
    }
    Some(descriptors[best_idx])
}

impl std::fmt::Debug for FeaturePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeaturePoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point() -> FeaturePoint {
        FeaturePoint::new(
            FeaturePointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            [0u8; 32],
            KeyframeId::new(0),
            1.5,
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut fp = point();
        fp.add_observation(KeyframeId::new(1), 5);
        fp.add_observation(KeyframeId::new(2), 10);
        assert_eq!(fp.num_observations(), 2);
        assert_eq!(fp.observations.get(&KeyframeId::new(1)), Some(&5));

        assert!(fp.erase_observation(KeyframeId::new(1)));
        assert_eq!(fp.num_observations(), 1);
        assert!(!fp.erase_observation(KeyframeId::new(1)));
    }

    #[test]
    fn test_found_ratio() {
        let mut fp = point();
        assert_eq!(fp.found_ratio(), 1.0);
        fp.increase_visible(3);
        assert_relative_eq!(fp.found_ratio(), 0.25);
        fp.visible_count = 0;
        assert_eq!(fp.found_ratio(), 1.0);
    }

    #[test]
    fn test_normal_and_depth() {
        let mut fp = point();
        let pyramid = ScalePyramid::new(1.2, 8);
        let centers = vec![Vector3::new(-1.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];
        fp.update_normal_and_depth(centers.into_iter(), (Vector3::zeros(), 0), &pyramid);

        assert_relative_eq!(fp.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(fp.max_distance, 4.0, epsilon = 1e-12);
        assert_relative_eq!(fp.min_distance, 4.0 / 1.2f64.powi(7), epsilon = 1e-12);
        assert!(fp.is_in_distance_range(4.0));
        assert!(!fp.is_in_distance_range(10.0));
        assert_eq!(fp.predict_level(4.0, &pyramid), 0);
    }

    #[test]
    fn test_distinctive_descriptor_is_median() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1;
        let c = [0xffu8; 32];
        assert_eq!(distinctive_descriptor(&[a, b, c]), Some(a));
        assert_eq!(distinctive_descriptor(&[]), None);
    }
}
