//! Keyframe - a retained frame that anchors landmarks.
//!
//! Keyframes are the nodes of the map graph. They keep the undistorted
//! keypoints and descriptors of the frame they were created from, the
//! feature point observed by each keypoint, and two graph relations:
//! covisibility (weighted by shared points) and a spanning tree.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, KeyPoint};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{FeaturePointId, KeyframeId};

/// A keyframe in the map.
#[derive(Clone)]
pub struct Keyframe {
    pub id: KeyframeId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,

    pub descriptors: Vec<Descriptor>,

    pub bow_vector: BowVector,

    /// Feature indices grouped by vocabulary node, for BoW-guided matching.
    pub feature_vector: FeatureVector,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// feature_points[i] = Some(fp) if keypoint i observes fp.
    feature_points: Vec<Option<FeaturePointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected keyframe -> number of shared feature points.
    covisibility_weights: HashMap<KeyframeId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    pub parent_id: Option<KeyframeId>,
    pub children_ids: HashSet<KeyframeId>,

    pub is_bad: bool,
}

impl Keyframe {
    pub fn new(
        id: KeyframeId,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let n = keypoints.len();
        Self {
            id,
            timestamp,
            pose,
            keypoints,
            descriptors,
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            feature_points: vec![None; n],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            is_bad: false,
        }
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform.
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Feature Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn feature_point(&self, feature_idx: usize) -> Option<FeaturePointId> {
        self.feature_points.get(feature_idx).copied().flatten()
    }

    /// Returns the previous association, if any.
    pub fn set_feature_point(
        &mut self,
        feature_idx: usize,
        fp_id: FeaturePointId,
    ) -> Option<FeaturePointId> {
        self.feature_points
            .get_mut(feature_idx)
            .and_then(|slot| slot.replace(fp_id))
    }

    pub fn erase_feature_point(&mut self, feature_idx: usize) -> Option<FeaturePointId> {
        self.feature_points.get_mut(feature_idx).and_then(Option::take)
    }

    /// (feature index, point) pairs for every associated keypoint.
    pub fn feature_point_indices(&self) -> impl Iterator<Item = (usize, FeaturePointId)> + '_ {
        self.feature_points
            .iter()
            .enumerate()
            .filter_map(|(i, fp)| fp.map(|id| (i, id)))
    }

    pub fn feature_point_slots(&self) -> &[Option<FeaturePointId>] {
        &self.feature_points
    }

    pub fn num_feature_points(&self) -> usize {
        self.feature_points.iter().filter(|fp| fp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_covisibility(&mut self, kf_id: KeyframeId, weight: usize) {
        if kf_id != self.id {
            self.covisibility_weights.insert(kf_id, weight);
        }
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyframeId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn covisibility_weight(&self, kf_id: KeyframeId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyframeId, usize> {
        &self.covisibility_weights
    }

    /// Covisible keyframes ordered by decreasing weight, ties by id.
    fn ordered_covisibles(&self) -> Vec<(KeyframeId, usize)> {
        let mut ordered: Vec<(KeyframeId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered
    }

    /// The `n` keyframes sharing the most points with this one.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyframeId> {
        self.ordered_covisibles()
            .into_iter()
            .take(n)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyframeId> {
        self.ordered_covisibles()
            .into_iter()
            .take_while(|&(_, w)| w >= min_weight)
            .map(|(id, _)| id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyframeId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyframeId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyframeId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for Keyframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyframe")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_feature_points", &self.num_feature_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe(id: u64, n: usize) -> Keyframe {
        let keypoints = (0..n).map(|i| KeyPoint::new(i as f64 * 10.0, 5.0, 0)).collect();
        Keyframe::new(KeyframeId::new(id), 0.0, SE3::identity(), keypoints, vec![[0u8; 32]; n])
    }

    #[test]
    fn test_feature_point_slots() {
        let mut kf = keyframe(0, 4);
        assert_eq!(kf.set_feature_point(1, FeaturePointId::new(10)), None);
        assert_eq!(
            kf.set_feature_point(1, FeaturePointId::new(11)),
            Some(FeaturePointId::new(10))
        );
        kf.set_feature_point(3, FeaturePointId::new(12));
        assert_eq!(kf.num_feature_points(), 2);
        assert_eq!(kf.feature_point(1), Some(FeaturePointId::new(11)));
        assert_eq!(kf.feature_point(9), None);

        assert_eq!(kf.erase_feature_point(3), Some(FeaturePointId::new(12)));
        let pairs: Vec<_> = kf.feature_point_indices().collect();
        assert_eq!(pairs, vec![(1, FeaturePointId::new(11))]);
    }

    #[test]
    fn test_best_covisibles_ordering() {
        let mut kf = keyframe(0, 0);
        kf.add_covisibility(KeyframeId::new(1), 5);
        kf.add_covisibility(KeyframeId::new(2), 20);
        kf.add_covisibility(KeyframeId::new(3), 5);
        kf.add_covisibility(KeyframeId::new(0), 99);

        assert_eq!(
            kf.best_covisibles(3),
            vec![KeyframeId::new(2), KeyframeId::new(1), KeyframeId::new(3)]
        );
        assert_eq!(kf.covisibles_above_weight(15), vec![KeyframeId::new(2)]);
        assert_eq!(kf.covisibility_weight(KeyframeId::new(0)), 0);

        kf.erase_covisibility(KeyframeId::new(2));
        assert_eq!(kf.best_covisibles(1), vec![KeyframeId::new(1)]);
    }

    #[test]
    fn test_spanning_tree_links() {
        let mut kf = keyframe(1, 0);
        assert!(kf.is_root());
        kf.set_parent(KeyframeId::new(0));
        kf.add_child(KeyframeId::new(2));
        assert!(!kf.is_root());
        kf.erase_child(KeyframeId::new(2));
        assert!(kf.children_ids.is_empty());
    }
}
