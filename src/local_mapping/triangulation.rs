//! New feature points from a fresh keyframe and its covisible neighbors.
//!
//! For each neighbor pair:
//! 1. Skip pairs whose baseline is tiny compared to the scene depth
//! 2. Find epipolar-constrained matches between unmatched keypoints
//! 3. Triangulate with DLT
//! 4. Validate parallax, depth, reprojection error and scale consistency

use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::triangulate_dlt;
use crate::map::{FeaturePointId, KeyframeId, Map};
use crate::tracking::frame::Camera;
use crate::tracking::matching::{fundamental_between, search_for_triangulation};

/// Rays closer than this (cosine) have too little parallax.
const MAX_PARALLAX_COS: f64 = 0.9998;
/// χ² (2 DOF, 95%) on the reprojection error.
const CHI2_MONO: f64 = 5.991;
/// Pairs whose baseline is below this fraction of the median depth are skipped.
const MIN_BASELINE_RATIO: f64 = 0.01;

#[derive(Debug, Default, Clone)]
pub struct TriangulationReport {
    pub pairs_checked: usize,
    pub candidates: usize,
    pub created: Vec<FeaturePointId>,
}

/// Median depth of the keyframe's points in its own camera frame.
pub fn scene_median_depth(map: &Map, kf_id: KeyframeId) -> Option<f64> {
    let kf = map.keyframe(kf_id)?;
    let pose_cw = kf.pose_cw();
    let mut depths: Vec<f64> = kf
        .feature_point_indices()
        .filter_map(|(_, id)| map.good_feature_point(id))
        .map(|fp| pose_cw.transform_point(&fp.position).z)
        .collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(|a, b| a.total_cmp(b));
    Some(depths[(depths.len() - 1) / 2])
}

/// Triangulate new points between `kf_id` and its `num_neighbors` best
/// covisible keyframes.
pub fn triangulate_new_points(
    map: &mut Map,
    kf_id: KeyframeId,
    camera: &Camera,
    num_neighbors: usize,
) -> TriangulationReport {
    let mut report = TriangulationReport::default();
    let Some(kf1) = map.keyframe(kf_id) else {
        return report;
    };
    let neighbors = kf1.best_covisibles(num_neighbors);
    let k = camera.k_matrix();
    let pyramid = map.pyramid().clone();

    for neighbor_id in neighbors {
        // Both borrows are re-taken per pair since points are inserted below.
        let (Some(kf1), Some(kf2)) = (map.keyframe(kf_id), map.keyframe(neighbor_id)) else {
            continue;
        };
        if kf2.is_bad {
            continue;
        }
        report.pairs_checked += 1;

        let center1 = kf1.camera_center();
        let center2 = kf2.camera_center();
        let baseline = (center2 - center1).norm();
        let Some(median_depth) = scene_median_depth(map, neighbor_id) else {
            continue;
        };
        if baseline / median_depth < MIN_BASELINE_RATIO {
            continue;
        }

        let pose1_cw = kf1.pose_cw();
        let pose2_cw = kf2.pose_cw();
        let Some(f12) = fundamental_between(&pose1_cw, &pose2_cw, &k) else {
            continue;
        };
        let matches = search_for_triangulation(kf1, kf2, &f12, camera, &pyramid);
        report.candidates += matches.len();

        let rot1 = kf1.pose.rotation;
        let rot2 = kf2.pose.rotation;
        let timestamp = kf1.timestamp;
        let mut accepted: Vec<(usize, usize, Vector3<f64>)> = Vec::new();
        for (idx1, idx2) in matches {
            let kp1 = &kf1.keypoints[idx1];
            let kp2 = &kf2.keypoints[idx2];
            let xn1 = camera.normalize(&kp1.pt);
            let xn2 = camera.normalize(&kp2.pt);

            let ray1 = rot1 * xn1.push(1.0);
            let ray2 = rot2 * xn2.push(1.0);
            let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
            if cos_parallax <= 0.0 || cos_parallax >= MAX_PARALLAX_COS {
                continue;
            }
            let Some(x3d) = triangulate_dlt(&xn1, &xn2, &pose1_cw, &pose2_cw) else {
                continue;
            };

            let mut valid = true;
            for (pose_cw, kp) in [(&pose1_cw, kp1), (&pose2_cw, kp2)] {
                let p_c = pose_cw.transform_point(&x3d);
                let chi2 = camera
                    .project(&p_c)
                    .map(|uv| (uv - kp.pt).norm_squared() / pyramid.sigma2(kp.octave))
                    .unwrap_or(f64::INFINITY);
                if chi2 > CHI2_MONO {
                    valid = false;
                    break;
                }
            }
            if !valid {
                continue;
            }

            // Scale consistency: distance ratio should follow the octave ratio.
            let dist1 = (x3d - center1).norm();
            let dist2 = (x3d - center2).norm();
            if dist1 <= 0.0 || dist2 <= 0.0 {
                continue;
            }
            let ratio_dist = dist2 / dist1;
            let ratio_octave = pyramid.scale(kp1.octave) / pyramid.scale(kp2.octave);
            let ratio_factor = 1.5 * pyramid.scale(1);
            if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
                continue;
            }

            accepted.push((idx1, idx2, x3d));
        }

        let descriptors: Vec<_> = accepted
            .iter()
            .map(|&(idx1, _, _)| kf1.descriptors[idx1])
            .collect();
        for ((idx1, idx2, x3d), descriptor) in accepted.into_iter().zip(descriptors) {
            let fp_id = map.insert_feature_point(x3d, descriptor, kf_id, timestamp);
            if !map.associate(kf_id, idx1, fp_id) || !map.associate(neighbor_id, idx2, fp_id) {
                map.erase_feature_point(fp_id);
                continue;
            }
            map.refresh_feature_point(fp_id);
            report.created.push(fp_id);
        }
    }

    if !report.created.is_empty() {
        debug!(
            "[Triangulation] {}: {} new points (pairs={}, candidates={})",
            kf_id,
            report.created.len(),
            report.pairs_checked,
            report.candidates
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::{Descriptor, KeyPoint, ScalePyramid};
    use crate::vocabulary::tests::tiny;
    use crate::vocabulary::FEATURE_VECTOR_LEVELS_UP;
    use nalgebra::UnitQuaternion;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    /// Two keyframes 0.5 apart. The first `mapped` points already exist in
    /// the map; the rest are only keypoints in both keyframes.
    fn two_keyframes(n: usize, mapped: usize) -> (Map, Vec<Vector3<f64>>, KeyframeId) {
        let cam = camera();
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let points: Vec<Vector3<f64>> = (0..n)
            .map(|_| Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(4.0..6.0)))
            .collect();
        let descriptors: Vec<Descriptor> = (0..n).map(|_| rng.gen()).collect();
        let poses = [
            SE3::identity(),
            SE3::from_quaternion(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0)),
        ];

        let mut map = Map::new(ScalePyramid::new(1.2, 8));
        let ids: Vec<FeaturePointId> = points[..mapped]
            .iter()
            .zip(&descriptors)
            .map(|(p, d)| map.insert_feature_point(*p, *d, KeyframeId::new(0), 0.0))
            .collect();
        let observations: Vec<(usize, FeaturePointId)> = ids.iter().copied().enumerate().collect();

        let mut last = KeyframeId::new(0);
        for (i, pose) in poses.iter().enumerate() {
            let pose_cw = pose.inverse();
            let keypoints: Vec<KeyPoint> = points
                .iter()
                .map(|p| {
                    let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                    KeyPoint::new(uv.x, uv.y, 0)
                })
                .collect();
            last = map.insert_keyframe(i as f64, *pose, keypoints, descriptors.clone(), &observations);
            let (bow, feat) = tiny().transform(&descriptors, FEATURE_VECTOR_LEVELS_UP);
            map.attach_bow(last, bow, feat);
        }
        for id in ids {
            map.refresh_feature_point(id);
        }
        (map, points, last)
    }

    #[test]
    fn test_triangulates_unmatched_keypoints() {
        let (mut map, points, kf) = two_keyframes(60, 20);
        assert_eq!(map.point_count(), 20);

        let report = triangulate_new_points(&mut map, kf, &camera(), 10);
        assert_eq!(report.pairs_checked, 1);
        assert!(report.created.len() >= 35, "created {}", report.created.len());
        assert_eq!(map.point_count(), 20 + report.created.len());

        let kf_ref = map.keyframe(kf).unwrap();
        for (idx, fp_id) in kf_ref.feature_point_indices().filter(|(i, _)| *i >= 20) {
            let fp = map.feature_point(fp_id).unwrap();
            assert!((fp.position - points[idx]).norm() < 1e-3);
            assert_eq!(fp.num_observations(), 2);
            assert!(fp.max_distance > fp.min_distance);
        }
    }

    #[test]
    fn test_median_depth() {
        let (map, _, kf) = two_keyframes(30, 30);
        let depth = scene_median_depth(&map, kf).unwrap();
        assert!(depth > 4.0 && depth < 6.0);
        assert!(scene_median_depth(&map, KeyframeId::new(99)).is_none());
    }

    #[test]
    fn test_no_neighbors_no_points() {
        let (mut map, _, kf) = two_keyframes(30, 0);
        // Without shared points the keyframes are not covisible.
        let report = triangulate_new_points(&mut map, kf, &camera(), 10);
        assert_eq!(report.pairs_checked, 0);
        assert!(report.created.is_empty());
    }
}
