//! Map - container for Keyframes and FeaturePoints.
//!
//! The Map owns every keyframe and feature point; everything else refers to
//! them through [`KeyframeId`] / [`FeaturePointId`] handles. Associations
//! between the two are always made through the Map so that both sides and
//! the covisibility weights stay consistent.

use std::collections::{BTreeMap, HashMap, HashSet};

use nalgebra::Vector3;
use tracing::debug;

use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, KeyPoint, ScalePyramid};
use crate::vocabulary::{BowVector, FeatureVector};

use super::feature_point::FeaturePoint;
use super::keyframe::Keyframe;
use super::keyframe_db::KeyframeDatabase;
use super::types::{FeaturePointId, KeyframeId};

/// Keyframe redundancy policy applied by [`Map::cull`].
#[derive(Debug, Clone, Copy)]
pub struct CullPolicy {
    /// A keyframe is redundant when more than this fraction of its points
    /// are seen by enough other keyframes.
    pub redundancy_ratio: f64,
    /// Number of other keyframes that must observe a point at the same or
    /// finer scale for it to count as redundant.
    pub redundant_observers: usize,
}

impl Default for CullPolicy {
    fn default() -> Self {
        Self {
            redundancy_ratio: 0.9,
            redundant_observers: 3,
        }
    }
}

/// What a [`Map::cull`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullReport {
    pub keyframes_removed: usize,
    pub points_removed: usize,
}

/// Keyframes around the current frame used for local-map tracking.
#[derive(Debug, Clone, Default)]
pub struct LocalKeyframes {
    pub keyframes: Vec<KeyframeId>,
    /// Keyframe sharing the most points with the frame.
    pub reference: Option<KeyframeId>,
}

/// The SLAM map.
pub struct Map {
    keyframes: BTreeMap<KeyframeId, Keyframe>,
    feature_points: BTreeMap<FeaturePointId, FeaturePoint>,
    next_kf_id: u64,
    next_fp_id: u64,
    last_keyframe_id: Option<KeyframeId>,
    pyramid: ScalePyramid,
    keyframe_db: KeyframeDatabase,
    cull_policy: CullPolicy,
}

impl Map {
    pub fn new(pyramid: ScalePyramid) -> Self {
        Self {
            keyframes: BTreeMap::new(),
            feature_points: BTreeMap::new(),
            next_kf_id: 0,
            next_fp_id: 0,
            last_keyframe_id: None,
            pyramid,
            keyframe_db: KeyframeDatabase::new(),
            cull_policy: CullPolicy::default(),
        }
    }

    pub fn with_cull_policy(mut self, policy: CullPolicy) -> Self {
        self.cull_policy = policy;
        self
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframe Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe and associate the given `(keypoint index, point)`
    /// observations. Covisibility with every keyframe sharing those points is
    /// updated and the keyframe is attached to the spanning tree below its
    /// strongest covisible keyframe.
    pub fn insert_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        observations: &[(usize, FeaturePointId)],
    ) -> KeyframeId {
        let id = KeyframeId::new(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes
            .insert(id, Keyframe::new(id, timestamp, pose, keypoints, descriptors));
        self.last_keyframe_id = Some(id);

        for &(idx, fp_id) in observations {
            self.associate(id, idx, fp_id);
        }
        self.link_to_spanning_tree(id);
        id
    }

    /// Attach BoW data to a keyframe and index it for relocalization.
    pub fn attach_bow(&mut self, kf_id: KeyframeId, bow: BowVector, features: FeatureVector) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            self.keyframe_db.erase(kf_id, &kf.bow_vector);
            self.keyframe_db.add(kf_id, &bow);
            kf.bow_vector = bow;
            kf.feature_vector = features;
        }
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyframeId> + '_ {
        self.keyframes.keys().copied()
    }

    /// Most recently inserted keyframe still in the map.
    pub fn last_keyframe_id(&self) -> Option<KeyframeId> {
        self.last_keyframe_id
            .filter(|id| self.keyframes.contains_key(id))
            .or_else(|| self.keyframes.keys().next_back().copied())
    }

    /// Oldest keyframe; it roots the spanning tree and is never culled.
    pub fn root_keyframe_id(&self) -> Option<KeyframeId> {
        self.keyframes.keys().next().copied()
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    pub fn keyframe_at(&self, index: usize) -> Result<&Keyframe> {
        self.keyframes.values().nth(index).ok_or(SlamError::OutOfRange {
            index,
            len: self.keyframes.len(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // FeaturePoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn insert_feature_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        origin: KeyframeId,
        timestamp: f64,
    ) -> FeaturePointId {
        let id = FeaturePointId::new(self.next_fp_id);
        self.next_fp_id += 1;
        self.feature_points
            .insert(id, FeaturePoint::new(id, position, descriptor, origin, timestamp));
        id
    }

    pub fn feature_point(&self, id: FeaturePointId) -> Option<&FeaturePoint> {
        self.feature_points.get(&id)
    }

    pub fn feature_point_mut(&mut self, id: FeaturePointId) -> Option<&mut FeaturePoint> {
        self.feature_points.get_mut(&id)
    }

    /// A point that exists and is not flagged bad.
    pub fn good_feature_point(&self, id: FeaturePointId) -> Option<&FeaturePoint> {
        self.feature_points.get(&id).filter(|fp| !fp.is_bad)
    }

    pub fn feature_points(&self) -> impl Iterator<Item = &FeaturePoint> {
        self.feature_points.values()
    }

    pub fn feature_points_mut(&mut self) -> impl Iterator<Item = &mut FeaturePoint> {
        self.feature_points.values_mut()
    }

    pub fn point_count(&self) -> usize {
        self.feature_points.len()
    }

    pub fn point_at(&self, index: usize) -> Result<&FeaturePoint> {
        self.feature_points
            .values()
            .nth(index)
            .ok_or(SlamError::OutOfRange {
                index,
                len: self.feature_points.len(),
            })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (Keyframe ↔ FeaturePoint)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link keypoint `feature_idx` of `kf_id` to `fp_id`.
    ///
    /// Any point previously held by that keypoint is disassociated first.
    /// Every other keyframe observing `fp_id` gains one unit of covisibility
    /// weight with `kf_id`, in both directions.
    ///
    /// Returns false if either handle does not resolve or the keypoint index
    /// is out of range.
    pub fn associate(&mut self, kf_id: KeyframeId, feature_idx: usize, fp_id: FeaturePointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() {
            return false;
        }
        let previous = kf.feature_point(feature_idx);
        if previous == Some(fp_id) {
            return true;
        }
        let Some(fp) = self.feature_points.get(&fp_id) else {
            return false;
        };
        if fp.is_observed_by(kf_id) {
            // A keyframe observes a point through one keypoint only.
            return false;
        }
        let existing_observers: Vec<KeyframeId> = fp.observations.keys().copied().collect();

        if let Some(old) = previous {
            self.disassociate(kf_id, old);
        }

        if let Some(fp) = self.feature_points.get_mut(&fp_id) {
            fp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_feature_point(feature_idx, fp_id);
        }

        for other_id in existing_observers {
            if other_id == kf_id {
                continue;
            }
            let new_weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_id, new_weight);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, new_weight);
            }
        }

        self.link_to_spanning_tree(kf_id);
        true
    }

    /// Remove the observation of `fp_id` by `kf_id`, decrementing the
    /// covisibility with the point's other observers.
    ///
    /// Returns false if the keyframe did not observe the point.
    pub fn disassociate(&mut self, kf_id: KeyframeId, fp_id: FeaturePointId) -> bool {
        let Some(feature_idx) = self
            .feature_points
            .get(&fp_id)
            .and_then(|fp| fp.observations.get(&kf_id).copied())
        else {
            return false;
        };

        let other_observers: Vec<KeyframeId> = self
            .feature_points
            .get(&fp_id)
            .map(|fp| {
                fp.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            if kf.feature_point(feature_idx) == Some(fp_id) {
                kf.erase_feature_point(feature_idx);
            }
        }
        if let Some(fp) = self.feature_points.get_mut(&fp_id) {
            fp.erase_observation(kf_id);
        }

        for other_id in other_observers {
            let current = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0);
            if current <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_id);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.erase_covisibility(kf_id);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_id, current - 1);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.add_covisibility(kf_id, current - 1);
                }
            }
        }
        true
    }

    /// Give a parentless, non-root keyframe its strongest covisible
    /// keyframe as spanning-tree parent.
    fn link_to_spanning_tree(&mut self, kf_id: KeyframeId) {
        if Some(kf_id) == self.root_keyframe_id() {
            return;
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.parent_id.is_some() {
            return;
        }
        let Some(&parent) = kf.best_covisibles(1).first() else {
            return;
        };
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_parent(parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(kf_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove a point and every keyframe observation of it.
    pub fn erase_feature_point(&mut self, fp_id: FeaturePointId) {
        let observers: Vec<KeyframeId> = self
            .feature_points
            .get(&fp_id)
            .map(|fp| fp.observations.keys().copied().collect())
            .unwrap_or_default();
        for kf_id in observers {
            self.disassociate(kf_id, fp_id);
        }
        self.feature_points.remove(&fp_id);
    }

    /// Remove a keyframe: its observations, covisibility edges, database
    /// entry and spanning-tree links. Children are re-parented to the
    /// removed keyframe's parent.
    pub fn erase_keyframe(&mut self, kf_id: KeyframeId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let associations: Vec<FeaturePointId> = kf.feature_point_indices().map(|(_, id)| id).collect();
        let parent_id = kf.parent_id;
        let children: Vec<KeyframeId> = kf.children_ids.iter().copied().collect();
        let bow = kf.bow_vector.clone();

        for fp_id in associations {
            self.disassociate(kf_id, fp_id);
        }
        let covisibles: Vec<KeyframeId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibility_weights().keys().copied().collect())
            .unwrap_or_default();
        for other_id in covisibles {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.erase_covisibility(kf_id);
            }
        }
        self.keyframe_db.erase(kf_id, &bow);

        if let Some(parent) = parent_id {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
            }
            for child_id in &children {
                if let Some(child) = self.keyframes.get_mut(child_id) {
                    child.set_parent(parent);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                    parent_kf.add_child(*child_id);
                }
            }
        } else if let Some((&new_root, rest)) = children.split_first() {
            if let Some(root) = self.keyframes.get_mut(&new_root) {
                root.parent_id = None;
            }
            for child_id in rest {
                if let Some(child) = self.keyframes.get_mut(child_id) {
                    child.set_parent(new_root);
                }
                if let Some(root) = self.keyframes.get_mut(&new_root) {
                    root.add_child(*child_id);
                }
            }
        }

        self.keyframes.remove(&kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Culling
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove redundant keyframes, then every point that is bad or no longer
    /// observed by any keyframe.
    ///
    /// A keyframe is redundant when more than `redundancy_ratio` of its
    /// points are each observed by at least `redundant_observers` other
    /// keyframes at the same or a finer pyramid level. The root and the
    /// newest keyframe are never removed.
    pub fn cull(&mut self) -> CullReport {
        let mut report = CullReport::default();
        let protected = [self.root_keyframe_id(), self.last_keyframe_id()];

        let ids: Vec<KeyframeId> = self.keyframes.keys().copied().collect();
        for kf_id in ids {
            if protected.contains(&Some(kf_id)) {
                continue;
            }
            if self.is_redundant(kf_id) {
                debug!("[Map] Culling redundant keyframe {}", kf_id);
                self.erase_keyframe(kf_id);
                report.keyframes_removed += 1;
            }
        }

        let doomed: Vec<FeaturePointId> = self
            .feature_points
            .values()
            .filter(|fp| fp.is_bad || fp.num_observations() == 0)
            .map(|fp| fp.id)
            .collect();
        for fp_id in doomed {
            self.erase_feature_point(fp_id);
            report.points_removed += 1;
        }
        report
    }

    fn is_redundant(&self, kf_id: KeyframeId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        let threshold = self.cull_policy.redundant_observers;
        let mut total = 0usize;
        let mut redundant = 0usize;

        for (idx, fp_id) in kf.feature_point_indices() {
            let Some(fp) = self.good_feature_point(fp_id) else {
                continue;
            };
            total += 1;
            if fp.num_observations() <= threshold {
                continue;
            }
            let level = kf.keypoints[idx].octave;
            let finer_observers = fp
                .observations
                .iter()
                .filter(|&(&other, _)| other != kf_id)
                .filter(|&(other, &other_idx)| {
                    self.keyframes
                        .get(other)
                        .and_then(|o| o.keypoints.get(other_idx))
                        .map_or(false, |kp| kp.octave <= level + 1)
                })
                .count();
            if finer_observers >= threshold {
                redundant += 1;
            }
        }

        total > 0 && redundant as f64 > self.cull_policy.redundancy_ratio * total as f64
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Keyframes observing the given points (K1) plus, for each of them, one
    /// not-yet-included best covisible keyframe, child and parent (K2), up
    /// to `limit` keyframes.
    pub fn local_keyframes(
        &self,
        matched: impl IntoIterator<Item = FeaturePointId>,
        limit: usize,
        neighbors: usize,
    ) -> LocalKeyframes {
        let mut counts: HashMap<KeyframeId, usize> = HashMap::new();
        for fp_id in matched {
            if let Some(fp) = self.good_feature_point(fp_id) {
                for kf_id in fp.observations.keys() {
                    *counts.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }

        let mut k1: Vec<(KeyframeId, usize)> = counts
            .into_iter()
            .filter(|(id, _)| self.keyframes.get(id).map_or(false, |kf| !kf.is_bad))
            .collect();
        k1.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let reference = k1.first().map(|&(id, _)| id);

        let mut included: HashSet<KeyframeId> = k1.iter().map(|&(id, _)| id).collect();
        let mut local: Vec<KeyframeId> = k1.iter().map(|&(id, _)| id).collect();

        let k1_ids = local.clone();
        for kf_id in k1_ids {
            if local.len() >= limit {
                break;
            }
            let Some(kf) = self.keyframes.get(&kf_id) else {
                continue;
            };
            let mut children: Vec<KeyframeId> = kf.children_ids.iter().copied().collect();
            children.sort();
            let extras = [
                kf.best_covisibles(neighbors)
                    .into_iter()
                    .find(|id| !included.contains(id)),
                children.into_iter().find(|id| !included.contains(id)),
                kf.parent_id.filter(|id| !included.contains(id)),
            ];
            for id in extras.into_iter().flatten() {
                if included.insert(id) {
                    local.push(id);
                }
            }
        }
        local.truncate(limit.max(1));

        LocalKeyframes {
            keyframes: local,
            reference,
        }
    }

    /// Good points observed by any of the keyframes, without duplicates, in
    /// keyframe then keypoint order.
    pub fn points_of_keyframes(&self, kf_ids: &[KeyframeId]) -> Vec<FeaturePointId> {
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        for kf_id in kf_ids {
            let Some(kf) = self.keyframes.get(kf_id) else {
                continue;
            };
            for (_, fp_id) in kf.feature_point_indices() {
                if self.good_feature_point(fp_id).is_some() && seen.insert(fp_id) {
                    points.push(fp_id);
                }
            }
        }
        points
    }

    /// Number of points of `kf_id` observed by at least `min_observations`
    /// keyframes.
    pub fn tracked_points(&self, kf_id: KeyframeId, min_observations: usize) -> usize {
        self.keyframes.get(&kf_id).map_or(0, |kf| {
            kf.feature_point_indices()
                .filter_map(|(_, id)| self.good_feature_point(id))
                .filter(|fp| fp.num_observations() >= min_observations)
                .count()
        })
    }

    /// Recompute a point's representative descriptor, viewing normal and
    /// distance range from its current observations.
    pub fn refresh_feature_point(&mut self, fp_id: FeaturePointId) {
        let Some(fp) = self.feature_points.get(&fp_id) else {
            return;
        };
        let mut descriptors = Vec::with_capacity(fp.observations.len());
        let mut centers = Vec::with_capacity(fp.observations.len());
        for (kf_id, &idx) in &fp.observations {
            if let Some(kf) = self.keyframes.get(kf_id).filter(|kf| !kf.is_bad) {
                centers.push(kf.camera_center());
                if let Some(d) = kf.descriptors.get(idx) {
                    descriptors.push(*d);
                }
            }
        }
        if centers.is_empty() {
            return;
        }
        // Distance range is anchored at the origin keyframe, or any observer
        // once the origin is gone.
        let reference = fp
            .observations
            .get(&fp.origin)
            .map(|&idx| (fp.origin, idx))
            .or_else(|| fp.observations.iter().next().map(|(&k, &i)| (k, i)))
            .and_then(|(kf_id, idx)| {
                let kf = self.keyframes.get(&kf_id)?;
                Some((kf.camera_center(), kf.keypoints.get(idx)?.octave))
            });

        let pyramid = self.pyramid.clone();
        if let Some(fp) = self.feature_points.get_mut(&fp_id) {
            fp.update_descriptor(&descriptors);
            if let Some(reference) = reference {
                fp.update_normal_and_depth(centers.into_iter(), reference, &pyramid);
            }
        }
    }

    /// Scale the whole map about the world origin.
    pub fn rescale(&mut self, factor: f64) {
        for kf in self.keyframes.values_mut() {
            kf.pose.translation *= factor;
        }
        for fp in self.feature_points.values_mut() {
            fp.position *= factor;
            fp.min_distance *= factor;
            fp.max_distance *= factor;
        }
    }

    /// Keyframes resembling `bow`, best first.
    pub fn relocalization_candidates(&self, bow: &BowVector, score_ratio: f64) -> Vec<KeyframeId> {
        self.keyframe_db
            .relocalization_candidates(bow, &self.keyframes, score_ratio)
    }

    /// Drop every keyframe and point; ids keep increasing.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.feature_points.clear();
        self.keyframe_db.clear();
        self.last_keyframe_id = None;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new(ScalePyramid::default())
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_feature_points", &self.feature_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn keypoints(n: usize, octave: usize) -> Vec<KeyPoint> {
        (0..n).map(|i| KeyPoint::new(i as f64, 0.0, octave)).collect()
    }

    fn add_keyframe(map: &mut Map, n: usize) -> KeyframeId {
        map.insert_keyframe(0.0, SE3::identity(), keypoints(n, 0), vec![[0u8; 32]; n], &[])
    }

    fn add_point(map: &mut Map, origin: KeyframeId) -> FeaturePointId {
        map.insert_feature_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], origin, 0.0)
    }

    /// Every observation is mirrored on both sides and covisibility weights
    /// equal the number of shared points.
    fn assert_consistent(map: &Map) {
        for fp in map.feature_points() {
            for (kf_id, &idx) in &fp.observations {
                let kf = map.keyframe(*kf_id).expect("observer exists");
                assert_eq!(kf.feature_point(idx), Some(fp.id));
            }
        }
        for kf in map.keyframes() {
            for (other, &w) in kf.covisibility_weights() {
                let shared = kf
                    .feature_point_indices()
                    .filter(|(_, id)| map.feature_point(*id).unwrap().is_observed_by(*other))
                    .count();
                assert_eq!(w, shared);
                assert_eq!(map.keyframe(*other).unwrap().covisibility_weight(kf.id), w);
            }
        }
    }

    #[test]
    fn test_insert_keyframe_and_point() {
        let mut map = Map::default();
        let kf_id = map.insert_keyframe(1.25, SE3::identity(), vec![], vec![], &[]);
        assert_eq!(kf_id, KeyframeId::new(0));
        assert_eq!(map.keyframe_count(), 1);
        assert_eq!(map.keyframe(kf_id).unwrap().timestamp, 1.25);

        let fp_id = map.insert_feature_point(Vector3::new(1.0, 2.0, 3.0), [7u8; 32], kf_id, 1.25);
        assert_eq!(fp_id, FeaturePointId::new(0));
        assert_eq!(map.point_count(), 1);
        assert_eq!(map.point_at(0).unwrap().position, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(map.point_at(0).unwrap().origin, kf_id);
    }

    #[test]
    fn test_index_out_of_range() {
        let mut map = Map::default();
        add_keyframe(&mut map, 0);
        assert!(matches!(
            map.point_at(0),
            Err(SlamError::OutOfRange { index: 0, len: 0 })
        ));
        assert!(matches!(
            map.keyframe_at(1),
            Err(SlamError::OutOfRange { index: 1, len: 1 })
        ));
        assert!(map.keyframe_at(0).is_ok());
    }

    #[test]
    fn test_associate_updates_covisibility() {
        let mut map = Map::default();
        let kf1 = add_keyframe(&mut map, 10);
        let kf2 = add_keyframe(&mut map, 10);
        let fp = add_point(&mut map, kf1);

        assert!(map.associate(kf1, 0, fp));
        assert!(map.associate(kf2, 3, fp));

        let point = map.feature_point(fp).unwrap();
        assert_eq!(point.num_observations(), 2);
        assert_eq!(point.observations.get(&kf2), Some(&3));
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 1);
        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 1);
        assert_eq!(map.keyframe(kf2).unwrap().parent_id, Some(kf1));
        assert!(map.keyframe(kf1).unwrap().children_ids.contains(&kf2));

        // Out-of-range keypoint and duplicate observation are rejected.
        assert!(!map.associate(kf2, 10, fp));
        assert!(!map.associate(kf2, 4, fp));
        assert_consistent(&map);
    }

    #[test]
    fn test_insert_keyframe_with_observations() {
        let mut map = Map::default();
        let kf1 = add_keyframe(&mut map, 5);
        let points: Vec<_> = (0..3).map(|_| add_point(&mut map, kf1)).collect();
        for (i, &fp) in points.iter().enumerate() {
            map.associate(kf1, i, fp);
        }

        let obs: Vec<_> = points.iter().enumerate().map(|(i, &fp)| (i + 1, fp)).collect();
        let kf2 = map.insert_keyframe(1.0, SE3::identity(), keypoints(5, 0), vec![[0u8; 32]; 5], &obs);

        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 3);
        assert_eq!(map.keyframe(kf2).unwrap().parent_id, Some(kf1));
        assert_eq!(map.last_keyframe_id(), Some(kf2));
        assert_consistent(&map);
    }

    #[test]
    fn test_disassociate() {
        let mut map = Map::default();
        let kf1 = add_keyframe(&mut map, 10);
        let kf2 = add_keyframe(&mut map, 10);
        let fp = add_point(&mut map, kf1);
        map.associate(kf1, 0, fp);
        map.associate(kf2, 0, fp);

        assert!(map.disassociate(kf1, fp));
        assert!(!map.disassociate(kf1, fp));

        let point = map.feature_point(fp).unwrap();
        assert_eq!(point.num_observations(), 1);
        assert!(point.is_observed_by(kf2));
        assert_eq!(map.keyframe(kf1).unwrap().feature_point(0), None);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
        assert_consistent(&map);
    }

    #[test]
    fn test_cull_removes_orphan_and_bad_points() {
        let mut map = Map::default();
        let kf = add_keyframe(&mut map, 10);
        let observed = add_point(&mut map, kf);
        let orphan = add_point(&mut map, kf);
        let bad = add_point(&mut map, kf);
        map.associate(kf, 0, observed);
        map.associate(kf, 1, bad);
        map.feature_point_mut(bad).unwrap().set_bad();

        let report = map.cull();
        assert_eq!(report, CullReport { keyframes_removed: 0, points_removed: 2 });
        assert!(map.feature_point(observed).is_some());
        assert!(map.feature_point(orphan).is_none());
        assert!(map.feature_point(bad).is_none());
        assert_eq!(map.keyframe(kf).unwrap().feature_point(1), None);
    }

    #[test]
    fn test_cull_redundant_keyframe() {
        let mut map = Map::default();
        let kfs: Vec<_> = (0..6).map(|_| add_keyframe(&mut map, 10)).collect();
        // Every point is seen by all six keyframes at level 0.
        for i in 0..10 {
            let fp = add_point(&mut map, kfs[0]);
            for &kf in &kfs {
                map.associate(kf, i, fp);
            }
        }
        let report = map.cull();

        // Root and newest survive. Keyframes in between are redundant while
        // their points keep more than three observers.
        assert!(map.keyframe(kfs[0]).is_some());
        assert!(map.keyframe(kfs[5]).is_some());
        assert_eq!(report.keyframes_removed, 3);
        assert_eq!(map.keyframe_count(), 3);
        assert!(map.keyframe(kfs[4]).is_some());
        assert_eq!(report.points_removed, 0);
        assert_consistent(&map);

        for fp in map.feature_points() {
            assert!(fp.observations.keys().all(|id| map.keyframe(*id).is_some()));
        }
    }

    #[test]
    fn test_erase_keyframe_reparents_children() {
        let mut map = Map::default();
        let kf0 = add_keyframe(&mut map, 4);
        let kf1 = add_keyframe(&mut map, 4);
        let kf2 = add_keyframe(&mut map, 4);
        let a = add_point(&mut map, kf0);
        map.associate(kf0, 0, a);
        map.associate(kf1, 0, a);
        let b = add_point(&mut map, kf1);
        map.associate(kf1, 1, b);
        map.associate(kf2, 1, b);
        assert_eq!(map.keyframe(kf2).unwrap().parent_id, Some(kf1));

        map.erase_keyframe(kf1);
        assert_eq!(map.keyframe(kf2).unwrap().parent_id, Some(kf0));
        assert!(map.keyframe(kf0).unwrap().children_ids.contains(&kf2));
        assert_eq!(map.feature_point(b).unwrap().num_observations(), 1);
        assert_consistent(&map);
    }

    #[test]
    fn test_local_keyframes() {
        let mut map = Map::default();
        let kf0 = add_keyframe(&mut map, 10);
        let kf1 = add_keyframe(&mut map, 10);
        let kf2 = add_keyframe(&mut map, 10);
        let kf3 = add_keyframe(&mut map, 10);

        let mut frame_points = Vec::new();
        for i in 0..3 {
            let fp = add_point(&mut map, kf0);
            map.associate(kf0, i, fp);
            map.associate(kf1, i, fp);
            frame_points.push(fp);
        }
        // kf2 shares a point with kf1 that the frame does not see.
        let hidden = add_point(&mut map, kf1);
        map.associate(kf1, 5, hidden);
        map.associate(kf2, 5, hidden);

        let local = map.local_keyframes(frame_points.iter().copied(), 80, 10);
        assert_eq!(local.reference, Some(kf0));
        assert_eq!(&local.keyframes[..2], &[kf0, kf1]);
        assert!(local.keyframes.contains(&kf2));
        assert!(!local.keyframes.contains(&kf3));

        let points = map.points_of_keyframes(&local.keyframes);
        assert_eq!(points.len(), 4);
    }

    #[test]
    fn test_refresh_and_rescale() {
        let mut map = Map::default();
        let kf0 = add_keyframe(&mut map, 2);
        let kf1 = map.insert_keyframe(
            0.1,
            SE3::from_quaternion(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0)),
            keypoints(2, 0),
            vec![[0u8; 32]; 2],
            &[],
        );
        let fp = add_point(&mut map, kf0);
        map.associate(kf0, 0, fp);
        map.associate(kf1, 0, fp);
        map.refresh_feature_point(fp);

        let point = map.feature_point(fp).unwrap();
        assert!((point.max_distance - 5.0).abs() < 1e-12);
        assert!(point.normal.z > 0.9);

        map.rescale(2.0);
        assert_eq!(map.feature_point(fp).unwrap().position.z, 10.0);
        assert_eq!(map.keyframe(kf1).unwrap().pose.translation.x, 2.0);
        assert_eq!(map.tracked_points(kf0, 2), 1);
    }
}
