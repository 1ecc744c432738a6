//! Descriptor matching between frames, keyframes and feature points.
//!
//! Every search returns candidate correspondences only; geometric
//! verification is left to pose optimization or RANSAC. Matches are
//! filtered by Hamming distance, a nearest-neighbor ratio where
//! applicable, and a rotation-consistency histogram.

use std::collections::HashSet;

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::geometry::SE3;
use crate::map::{FeaturePoint, FeaturePointId, Keyframe, Map};
use crate::tracking::frame::{descriptor_distance, Camera, KeyPoint, ScalePyramid, TH_HIGH, TH_LOW};
use crate::tracking::tracking_frame::Frame;

pub const HISTO_LENGTH: usize = 30;

/// Histogram of keypoint orientation differences. Matches falling outside
/// the three dominant bins are treated as inconsistent.
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    /// Record match `idx` between keypoints with angles `a1` and `a2` (degrees).
    pub fn add(&mut self, a1: f64, a2: f64, idx: usize) {
        let mut rot = a1 - a2;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot * HISTO_LENGTH as f64 / 360.0).round() as usize;
        if bin >= HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(idx);
    }

    fn three_maxima(&self) -> [Option<usize>; 3] {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).filter(|&b| !self.bins[b].is_empty()).collect();
        order.sort_by(|&a, &b| self.bins[b].len().cmp(&self.bins[a].len()).then(a.cmp(&b)));
        let count = |i: usize| order.get(i).map_or(0, |&b| self.bins[b].len());

        let max1 = count(0) as f64;
        let mut keep = [order.first().copied(), order.get(1).copied(), order.get(2).copied()];
        if (count(1) as f64) < 0.1 * max1 {
            keep[1] = None;
            keep[2] = None;
        } else if (count(2) as f64) < 0.1 * max1 {
            keep[2] = None;
        }
        keep
    }

    /// Indices recorded outside the dominant bins.
    pub fn outliers(&self) -> Vec<usize> {
        let keep = self.three_maxima();
        (0..HISTO_LENGTH)
            .filter(|b| !keep.contains(&Some(*b)))
            .flat_map(|b| self.bins[b].iter().copied())
            .collect()
    }
}

impl Default for RotationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// A feature point projected into a frame by the frustum test.
#[derive(Debug, Clone, Copy)]
pub struct ProjectedPoint {
    pub id: FeaturePointId,
    pub uv: Vector2<f64>,
    pub level: usize,
    pub view_cos: f64,
}

/// Project `fp` into a camera with pose `pose_cw` and center `center`.
///
/// The point must lie in front of the camera, inside the undistorted image
/// bounds, within its scale-invariance distance range, and be seen at less
/// than 60 degrees from its mean viewing direction.
pub fn project_in_frustum(
    fp: &FeaturePoint,
    pose_cw: &SE3,
    center: &Vector3<f64>,
    camera: &Camera,
    pyramid: &ScalePyramid,
) -> Option<ProjectedPoint> {
    let p_c = pose_cw.transform_point(&fp.position);
    let uv = camera.project(&p_c)?;
    if !camera.is_in_image(&uv) {
        return None;
    }
    let po = fp.position - center;
    let dist = po.norm();
    if !fp.is_in_distance_range(dist) {
        return None;
    }
    let view_cos = if fp.normal.norm_squared() > 0.0 {
        po.dot(&fp.normal) / dist
    } else {
        1.0
    };
    if view_cos < 0.5 {
        return None;
    }
    Some(ProjectedPoint {
        id: fp.id,
        uv,
        level: fp.predict_level(dist, pyramid),
        view_cos,
    })
}

fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Best and second-best descriptor distances over `candidates`.
struct BestTwo {
    best: u32,
    best_idx: Option<usize>,
    best_level: usize,
    second: u32,
    second_level: usize,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best: 256,
            best_idx: None,
            best_level: 0,
            second: 256,
            second_level: 0,
        }
    }

    fn push(&mut self, dist: u32, idx: usize, level: usize) {
        if dist < self.best {
            self.second = self.best;
            self.second_level = self.best_level;
            self.best = dist;
            self.best_idx = Some(idx);
            self.best_level = level;
        } else if dist < self.second {
            self.second = dist;
            self.second_level = level;
        }
    }
}

/// Match the frame against projected local-map points. Keypoints already
/// matched are skipped. Returns the number of new matches.
///
/// `th` scales the search radius; it is widened right after relocalization.
pub fn search_local_points(
    frame: &mut Frame,
    points: &[ProjectedPoint],
    map: &Map,
    th: f64,
    nn_ratio: f64,
) -> usize {
    let pyramid = map.pyramid();
    let mut matches = 0;
    for proj in points {
        let Some(fp) = map.good_feature_point(proj.id) else {
            continue;
        };
        let r = radius_by_viewing_cos(proj.view_cos) * th * pyramid.scale(proj.level);
        let candidates = frame.features_in_area(
            proj.uv.x,
            proj.uv.y,
            r,
            Some(proj.level.saturating_sub(1)),
            Some(proj.level),
        );

        let mut best = BestTwo::new();
        for idx in candidates {
            if frame.feature_points[idx].is_some() {
                continue;
            }
            let dist = descriptor_distance(&fp.descriptor, &frame.descriptors[idx]);
            best.push(dist, idx, frame.keypoints[idx].octave);
        }

        if let Some(idx) = best.best_idx {
            if best.best > TH_HIGH {
                continue;
            }
            if best.best_level == best.second_level && best.best as f64 > nn_ratio * best.second as f64 {
                continue;
            }
            frame.feature_points[idx] = Some(proj.id);
            matches += 1;
        }
    }
    matches
}

/// Project the last frame's inlier points into `current` using its pose and
/// match within `th` pixels (scaled by octave). Returns the number of matches.
pub fn search_by_projection_last_frame(
    current: &mut Frame,
    last: &Frame,
    map: &Map,
    camera: &Camera,
    th: f64,
) -> usize {
    let Some(pose_cw) = current.pose_cw() else {
        return 0;
    };
    let pyramid = map.pyramid();
    let mut histogram = RotationHistogram::new();
    let mut matches = 0;

    for (last_idx, fp_id) in last.inlier_matches() {
        let Some(fp) = map.good_feature_point(fp_id) else {
            continue;
        };
        let Some(uv) = camera.project(&pose_cw.transform_point(&fp.position)) else {
            continue;
        };
        if !camera.is_in_image(&uv) {
            continue;
        }
        let last_kp = &last.keypoints[last_idx];
        let octave = last_kp.octave;
        let radius = th * pyramid.scale(octave);
        let candidates = current.features_in_area(
            uv.x,
            uv.y,
            radius,
            Some(octave.saturating_sub(1)),
            Some(octave + 1),
        );

        let mut best_dist = 256;
        let mut best_idx = None;
        for idx in candidates {
            if current.feature_points[idx].is_some() {
                continue;
            }
            let dist = descriptor_distance(&fp.descriptor, &current.descriptors[idx]);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(idx);
            }
        }

        if let Some(idx) = best_idx.filter(|_| best_dist <= TH_HIGH) {
            current.feature_points[idx] = Some(fp_id);
            histogram.add(last_kp.angle, current.keypoints[idx].angle, idx);
            matches += 1;
        }
    }

    for idx in histogram.outliers() {
        current.feature_points[idx] = None;
        matches -= 1;
    }
    matches
}

/// Match the keyframe's points to frame features sharing a vocabulary node.
///
/// Returns per-frame-keypoint matches.
pub fn search_by_bow(kf: &Keyframe, frame: &Frame, map: &Map, nn_ratio: f64) -> Vec<Option<FeaturePointId>> {
    let mut matches: Vec<Option<FeaturePointId>> = vec![None; frame.num_features()];
    let mut histogram = RotationHistogram::new();

    for (node, kf_indices) in &kf.feature_vector {
        let Some(frame_indices) = frame.feature_vector.get(node) else {
            continue;
        };
        for &kf_idx in kf_indices {
            let Some(fp_id) = kf.feature_point(kf_idx) else {
                continue;
            };
            if map.good_feature_point(fp_id).is_none() {
                continue;
            }
            let d_kf = &kf.descriptors[kf_idx];

            let mut best1 = 256;
            let mut best2 = 256;
            let mut best_idx = None;
            for &f_idx in frame_indices {
                if matches[f_idx].is_some() {
                    continue;
                }
                let dist = descriptor_distance(d_kf, &frame.descriptors[f_idx]);
                if dist < best1 {
                    best2 = best1;
                    best1 = dist;
                    best_idx = Some(f_idx);
                } else if dist < best2 {
                    best2 = dist;
                }
            }

            if let Some(f_idx) = best_idx {
                if best1 <= TH_LOW && (best1 as f64) < nn_ratio * best2 as f64 {
                    matches[f_idx] = Some(fp_id);
                    histogram.add(kf.keypoints[kf_idx].angle, frame.keypoints[f_idx].angle, f_idx);
                }
            }
        }
    }

    for idx in histogram.outliers() {
        matches[idx] = None;
    }
    matches
}

/// Project the keyframe's points not in `already_found` into the frame and
/// match within `th` pixels. Used to extend a relocalization pose.
pub fn search_by_projection_keyframe(
    frame: &mut Frame,
    kf: &Keyframe,
    map: &Map,
    camera: &Camera,
    already_found: &HashSet<FeaturePointId>,
    th: f64,
    max_distance: u32,
) -> usize {
    let (Some(pose_cw), Some(center)) = (frame.pose_cw(), frame.camera_center()) else {
        return 0;
    };
    let pyramid = map.pyramid();
    let mut histogram = RotationHistogram::new();
    let mut matches = 0;

    for (kf_idx, fp_id) in kf.feature_point_indices() {
        if already_found.contains(&fp_id) {
            continue;
        }
        let Some(fp) = map.good_feature_point(fp_id) else {
            continue;
        };
        let Some(uv) = camera.project(&pose_cw.transform_point(&fp.position)) else {
            continue;
        };
        if !camera.is_in_image(&uv) {
            continue;
        }
        let dist3d = (fp.position - center).norm();
        if !fp.is_in_distance_range(dist3d) {
            continue;
        }
        let level = fp.predict_level(dist3d, pyramid);
        let radius = th * pyramid.scale(level);
        let candidates = frame.features_in_area(
            uv.x,
            uv.y,
            radius,
            Some(level.saturating_sub(1)),
            Some(level + 1),
        );

        let mut best_dist = 256;
        let mut best_idx = None;
        for idx in candidates {
            if frame.feature_points[idx].is_some() {
                continue;
            }
            let dist = descriptor_distance(&fp.descriptor, &frame.descriptors[idx]);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(idx);
            }
        }

        if let Some(idx) = best_idx.filter(|_| best_dist <= max_distance) {
            frame.feature_points[idx] = Some(fp_id);
            histogram.add(kf.keypoints[kf_idx].angle, frame.keypoints[idx].angle, idx);
            matches += 1;
        }
    }

    for idx in histogram.outliers() {
        frame.feature_points[idx] = None;
        matches -= 1;
    }
    matches
}

/// Match level-0 features of the reference frame to the current frame for
/// map initialization.
///
/// `prev_matched` holds, per reference keypoint, where it was last found; it
/// seeds the search window and is updated with the new positions. Returns
/// `matches[i1] = Some(i2)`.
pub fn search_for_initialization(
    f1: &Frame,
    f2: &Frame,
    prev_matched: &mut [Vector2<f64>],
    window: f64,
    nn_ratio: f64,
) -> Vec<Option<usize>> {
    let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
    let mut matches21: Vec<Option<usize>> = vec![None; f2.num_features()];
    let mut matched_distance = vec![u32::MAX; f2.num_features()];
    let mut histogram = RotationHistogram::new();

    for (i1, kp1) in f1.keypoints.iter().enumerate() {
        if kp1.octave > 0 {
            continue;
        }
        let Some(seed) = prev_matched.get(i1) else {
            continue;
        };
        let candidates = f2.features_in_area(seed.x, seed.y, window, Some(0), Some(0));

        let mut best = 256;
        let mut second = 256;
        let mut best_idx = None;
        for i2 in candidates {
            let dist = descriptor_distance(&f1.descriptors[i1], &f2.descriptors[i2]);
            if matched_distance[i2] <= dist {
                continue;
            }
            if dist < best {
                second = best;
                best = dist;
                best_idx = Some(i2);
            } else if dist < second {
                second = dist;
            }
        }

        let Some(i2) = best_idx else {
            continue;
        };
        if best > TH_LOW || (best as f64) >= second as f64 * nn_ratio {
            continue;
        }
        if let Some(prev_i1) = matches21[i2] {
            matches12[prev_i1] = None;
        }
        matches12[i1] = Some(i2);
        matches21[i2] = Some(i1);
        matched_distance[i2] = best;
        histogram.add(kp1.angle, f2.keypoints[i2].angle, i1);
    }

    for i1 in histogram.outliers() {
        // A histogram entry can be stale if the match was later stolen.
        if let Some(i2) = matches12[i1].take() {
            if matches21[i2] == Some(i1) {
                matches21[i2] = None;
            }
        }
    }

    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = m {
            prev_matched[i1] = f2.keypoints[*i2].pt;
        }
    }
    matches12
}

/// Fundamental matrix `F12` with `x1ᵀ F12 x2 = 0` between two keyframes.
pub fn fundamental_between(pose1_cw: &SE3, pose2_cw: &SE3, k: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let rel = pose1_cw.compose(&pose2_cw.inverse());
    let t12x = crate::geometry::so3::skew(&rel.translation);
    let k_inv = k.try_inverse()?;
    Some(k_inv.transpose() * t12x * rel.rotation_matrix() * k_inv)
}

fn epipolar_distance_ok(kp1: &KeyPoint, kp2: &KeyPoint, f12: &Matrix3<f64>, sigma2: f64) -> bool {
    // Epipolar line in the second image: l = x1ᵀ F12
    let a = kp1.pt.x * f12[(0, 0)] + kp1.pt.y * f12[(1, 0)] + f12[(2, 0)];
    let b = kp1.pt.x * f12[(0, 1)] + kp1.pt.y * f12[(1, 1)] + f12[(2, 1)];
    let c = kp1.pt.x * f12[(0, 2)] + kp1.pt.y * f12[(1, 2)] + f12[(2, 2)];
    let num = a * kp2.pt.x + b * kp2.pt.y + c;
    let den = a * a + b * b;
    if den == 0.0 {
        return false;
    }
    num * num / den < 3.84 * sigma2
}

/// Pairs of keypoints, unmatched in both keyframes, that satisfy the
/// epipolar constraint. Used to triangulate new feature points.
pub fn search_for_triangulation(
    kf1: &Keyframe,
    kf2: &Keyframe,
    f12: &Matrix3<f64>,
    camera: &Camera,
    pyramid: &ScalePyramid,
) -> Vec<(usize, usize)> {
    // Epipole: kf1's center seen from kf2. Matches close to it are
    // ill-conditioned for triangulation.
    let epipole = camera.project(&kf2.pose_cw().transform_point(&kf1.camera_center()));

    let mut matched2 = vec![false; kf2.num_features()];
    let mut matches12: Vec<Option<usize>> = vec![None; kf1.num_features()];
    let mut histogram = RotationHistogram::new();

    for (node, indices1) in &kf1.feature_vector {
        let Some(indices2) = kf2.feature_vector.get(node) else {
            continue;
        };
        for &i1 in indices1 {
            if kf1.feature_point(i1).is_some() {
                continue;
            }
            let kp1 = &kf1.keypoints[i1];
            let d1 = &kf1.descriptors[i1];
            let mut best_dist = TH_LOW;
            let mut best_idx = None;
            for &i2 in indices2 {
                if matched2[i2] || kf2.feature_point(i2).is_some() {
                    continue;
                }
                let dist = descriptor_distance(d1, &kf2.descriptors[i2]);
                if dist > TH_LOW || dist > best_dist {
                    continue;
                }
                let kp2 = &kf2.keypoints[i2];
                if let Some(e) = epipole {
                    if (e - kp2.pt).norm_squared() < 100.0 * pyramid.scale(kp2.octave) {
                        continue;
                    }
                }
                if epipolar_distance_ok(kp1, kp2, f12, pyramid.sigma2(kp2.octave)) {
                    best_idx = Some(i2);
                    best_dist = dist;
                }
            }
            if let Some(i2) = best_idx {
                matched2[i2] = true;
                matches12[i1] = Some(i2);
                histogram.add(kp1.angle, kf2.keypoints[i2].angle, i1);
            }
        }
    }

    for i1 in histogram.outliers() {
        matches12[i1] = None;
    }
    matches12
        .into_iter()
        .enumerate()
        .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
        .collect()
}
