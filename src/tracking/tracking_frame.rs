//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: the undistorted features of one
//! image, its Bag-of-Words vectors, the pose estimate and temporary
//! associations to feature points. Keypoints are bucketed into a
//! [`FeatureGrid`] so projection searches only look at nearby features.

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::map::FeaturePointId;
use crate::tracking::frame::{Camera, Descriptor, FeatureSet, KeyPoint};
use crate::vocabulary::{BowVector, FeatureVector, Vocabulary, FEATURE_VECTOR_LEVELS_UP};

/// Spatial grid for feature lookup.
///
/// The undistorted image bounds are divided into `GRID_COLS × GRID_ROWS`
/// cells, each holding the indices of the keypoints that fall inside it.
#[derive(Clone)]
pub struct FeatureGrid {
    /// Row-major: cells[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
    min_x: f64,
    min_y: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], camera: &Camera) -> Self {
        let (min_x, min_y) = (camera.min_x, camera.min_y);
        let width = (camera.max_x - min_x).max(1.0);
        let height = (camera.max_y - min_y).max(1.0);
        let grid_element_width_inv = Self::GRID_COLS as f64 / width;
        let grid_element_height_inv = Self::GRID_ROWS as f64 / height;

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];
        for (idx, kp) in keypoints.iter().enumerate() {
            let cx = ((kp.pt.x - min_x) * grid_element_width_inv).floor();
            let cy = ((kp.pt.y - min_y) * grid_element_height_inv).floor();
            // Keypoints that undistort outside the bounds are never searched.
            if cx < 0.0 || cy < 0.0 || cx >= Self::GRID_COLS as f64 || cy >= Self::GRID_ROWS as f64 {
                continue;
            }
            cells[cy as usize * Self::GRID_COLS + cx as usize].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
            min_x,
            min_y,
        }
    }

    /// Indices of keypoints in the cells overlapping the square of half-size
    /// `r` around `(x, y)`. Callers apply the exact distance test.
    pub fn candidates(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let min_cell_x = ((x - self.min_x - r) * self.grid_element_width_inv).floor();
        let max_cell_x = ((x - self.min_x + r) * self.grid_element_width_inv).floor();
        let min_cell_y = ((y - self.min_y - r) * self.grid_element_height_inv).floor();
        let max_cell_y = ((y - self.min_y + r) * self.grid_element_height_inv).floor();

        if max_cell_x < 0.0 || max_cell_y < 0.0 {
            return Vec::new();
        }
        let min_cell_x = min_cell_x.max(0.0) as usize;
        let min_cell_y = min_cell_y.max(0.0) as usize;
        let max_cell_x = (max_cell_x as usize).min(Self::GRID_COLS - 1);
        let max_cell_y = (max_cell_y as usize).min(Self::GRID_ROWS - 1);
        if min_cell_x > max_cell_x || min_cell_y > max_cell_y {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                candidates.extend(&self.cells[cell_y * Self::GRID_COLS + cell_x]);
            }
        }
        candidates
    }
}

/// A frame being tracked (not yet a Keyframe).
#[derive(Clone)]
pub struct Frame {
    /// Sequence number assigned by the tracker.
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub bow_vector: BowVector,
    pub feature_vector: FeatureVector,
    /// feature_points[i] = Some(fp) if keypoint i is matched to fp.
    pub feature_points: Vec<Option<FeaturePointId>>,
    /// Set by pose optimization for matches rejected as outliers.
    pub outliers: Vec<bool>,
    /// Camera-to-world pose, once estimated.
    pub pose: Option<SE3>,
    pub grid: FeatureGrid,
}

impl Frame {
    /// Build a frame from raw (distorted) features.
    pub fn new(id: u64, timestamp: f64, features: FeatureSet, camera: &Camera) -> Self {
        let keypoints: Vec<KeyPoint> = features
            .keypoints
            .iter()
            .map(|kp| KeyPoint {
                pt: camera.undistort_point(&kp.pt),
                ..*kp
            })
            .collect();
        let n = keypoints.len();
        let grid = FeatureGrid::new(&keypoints, camera);
        Self {
            id,
            timestamp,
            keypoints,
            descriptors: features.descriptors,
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            feature_points: vec![None; n],
            outliers: vec![false; n],
            pose: None,
            grid,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Compute the BoW vectors if not done yet.
    pub fn compute_bow(&mut self, vocabulary: &Vocabulary) {
        if self.bow_vector.is_empty() && !self.descriptors.is_empty() {
            let (bow, features) = vocabulary.transform(&self.descriptors, FEATURE_VECTOR_LEVELS_UP);
            self.bow_vector = bow;
            self.feature_vector = features;
        }
    }

    pub fn set_pose(&mut self, pose_wc: SE3) {
        self.pose = Some(pose_wc);
    }

    /// World-to-camera transform, if the pose is known.
    pub fn pose_cw(&self) -> Option<SE3> {
        self.pose.map(|p| p.inverse())
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.map(|p| p.translation)
    }

    /// Keypoints within `radius` (per axis) of `(x, y)`, optionally restricted
    /// to an octave range.
    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        self.grid
            .candidates(x, y, radius)
            .into_iter()
            .filter(|&idx| {
                let kp = &self.keypoints[idx];
                min_level.map_or(true, |min| kp.octave >= min)
                    && max_level.map_or(true, |max| kp.octave <= max)
                    && (kp.pt.x - x).abs() < radius
                    && (kp.pt.y - y).abs() < radius
            })
            .collect()
    }

    /// Drop every association.
    pub fn clear_matches(&mut self) {
        self.feature_points.iter_mut().for_each(|fp| *fp = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    /// Number of associations.
    pub fn num_matches(&self) -> usize {
        self.feature_points.iter().filter(|fp| fp.is_some()).count()
    }

    /// (keypoint index, point) pairs of associations not flagged outliers.
    pub fn inlier_matches(&self) -> impl Iterator<Item = (usize, FeaturePointId)> + '_ {
        self.feature_points
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.outliers[*i])
            .filter_map(|(i, fp)| fp.map(|id| (i, id)))
    }

    /// Remove associations flagged as outliers. Returns how many were dropped.
    pub fn discard_outliers(&mut self) -> usize {
        let mut removed = 0;
        for (fp, outlier) in self.feature_points.iter_mut().zip(self.outliers.iter_mut()) {
            if *outlier {
                if fp.take().is_some() {
                    removed += 1;
                }
                *outlier = false;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn frame(points: &[(f64, f64, usize)]) -> Frame {
        let features = FeatureSet {
            keypoints: points.iter().map(|&(x, y, o)| KeyPoint::new(x, y, o)).collect(),
            descriptors: vec![[0u8; 32]; points.len()],
        };
        Frame::new(0, 0.0, features, &camera())
    }

    #[test]
    fn test_features_in_area() {
        let f = frame(&[(100.0, 100.0, 0), (105.0, 98.0, 2), (300.0, 300.0, 0), (639.0, 479.0, 1)]);
        let mut near = f.features_in_area(102.0, 100.0, 10.0, None, None);
        near.sort();
        assert_eq!(near, vec![0, 1]);
        assert_eq!(f.features_in_area(102.0, 100.0, 10.0, Some(1), None), vec![1]);
        assert_eq!(f.features_in_area(102.0, 100.0, 10.0, None, Some(0)), vec![0]);
        assert_eq!(f.features_in_area(638.0, 478.0, 5.0, None, None), vec![3]);
        assert!(f.features_in_area(-50.0, -50.0, 5.0, None, None).is_empty());
    }

    #[test]
    fn test_outlier_bookkeeping() {
        let mut f = frame(&[(10.0, 10.0, 0), (20.0, 20.0, 0), (30.0, 30.0, 0)]);
        f.feature_points[0] = Some(FeaturePointId::new(1));
        f.feature_points[2] = Some(FeaturePointId::new(2));
        f.outliers[2] = true;
        assert_eq!(f.num_matches(), 2);
        assert_eq!(f.inlier_matches().collect::<Vec<_>>(), vec![(0, FeaturePointId::new(1))]);
        assert_eq!(f.discard_outliers(), 1);
        assert_eq!(f.num_matches(), 1);
        assert!(!f.outliers[2]);
    }
}
