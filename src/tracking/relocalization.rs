//! Recovery after tracking loss.
//!
//! Candidate keyframes come from the keyframe database. Each candidate with
//! enough BoW matches gets a P3P RANSAC pose, which is refined and extended
//! by guided projection search until enough inliers support it.

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::RelocalizationConfig;
use crate::geometry::{solve_pnp_ransac, PnpRansacParams};
use crate::map::{FeaturePointId, KeyframeId, Map};
use crate::optimizer::optimize_frame_pose;
use crate::tracking::frame::Camera;
use crate::tracking::matching::{search_by_bow, search_by_projection_keyframe};
use crate::tracking::tracking_frame::Frame;

const BOW_NN_RATIO: f64 = 0.75;
/// Guided searches: (window, max descriptor distance).
const WIDE_SEARCH: (f64, u32) = (10.0, 100);
const NARROW_SEARCH: (f64, u32) = (3.0, 64);
const MIN_NARROW_SEARCH_INLIERS: usize = 30;

/// Try to relocalize `frame` against the map.
///
/// The frame must carry its BoW vectors. On success the frame holds the
/// recovered pose and its inlier matches, and the keyframe that produced the
/// pose is returned.
pub fn relocalize(
    frame: &mut Frame,
    map: &Map,
    camera: &Camera,
    config: &RelocalizationConfig,
    rng: &mut ChaCha8Rng,
) -> Option<KeyframeId> {
    let candidates = map.relocalization_candidates(&frame.bow_vector, config.candidate_score_ratio);
    if candidates.is_empty() {
        debug!("[Reloc] no candidate keyframes");
        return None;
    }

    let mut viable = Vec::new();
    for kf_id in candidates {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        let matches = search_by_bow(kf, frame, map, BOW_NN_RATIO);
        let count = matches.iter().filter(|m| m.is_some()).count();
        if count >= config.min_bow_matches {
            viable.push((kf_id, matches));
        }
    }
    debug!("[Reloc] {} candidates with enough BoW matches", viable.len());

    let pyramid = map.pyramid();
    let pnp_params = PnpRansacParams {
        iterations: config.ransac_iterations,
        min_inliers: config.min_ransac_inliers,
        ..PnpRansacParams::default()
    };

    for (kf_id, matches) in viable {
        let mut indices = Vec::new();
        let mut points: Vec<Vector3<f64>> = Vec::new();
        let mut keypoints: Vec<Vector2<f64>> = Vec::new();
        let mut sigma2 = Vec::new();
        for (idx, fp_id) in matches.iter().enumerate() {
            let Some(fp) = fp_id.and_then(|id| map.good_feature_point(id)) else {
                continue;
            };
            let kp = &frame.keypoints[idx];
            indices.push(idx);
            points.push(fp.position);
            keypoints.push(kp.pt);
            sigma2.push(pyramid.sigma2(kp.octave));
        }

        let Some(pnp) = solve_pnp_ransac(&points, &keypoints, &sigma2, camera, &pnp_params, rng) else {
            continue;
        };

        frame.clear_matches();
        for (&idx, &inlier) in indices.iter().zip(&pnp.inlier_mask) {
            if inlier {
                frame.feature_points[idx] = matches[idx];
            }
        }
        frame.set_pose(pnp.pose_cw.inverse());

        let mut good = optimize_frame_pose(frame, map, camera);
        if good < config.min_ransac_inliers {
            continue;
        }
        frame.discard_outliers();

        if good < config.min_inliers {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            let found = found_points(frame);
            let additional =
                search_by_projection_keyframe(frame, kf, map, camera, &found, WIDE_SEARCH.0, WIDE_SEARCH.1);
            if additional + good >= config.min_inliers {
                good = optimize_frame_pose(frame, map, camera);

                // Many inliers but not enough: search again with a narrow
                // window around the refined pose.
                if good > MIN_NARROW_SEARCH_INLIERS && good < config.min_inliers {
                    let found: HashSet<FeaturePointId> = frame.inlier_matches().map(|(_, id)| id).collect();
                    let additional = search_by_projection_keyframe(
                        frame,
                        kf,
                        map,
                        camera,
                        &found,
                        NARROW_SEARCH.0,
                        NARROW_SEARCH.1,
                    );
                    if good + additional >= config.min_inliers {
                        good = optimize_frame_pose(frame, map, camera);
                    }
                }
                frame.discard_outliers();
            }
        }

        if good >= config.min_inliers {
            debug!("[Reloc] relocalized against {} with {} inliers", kf_id, good);
            return Some(kf_id);
        }
    }

    frame.clear_matches();
    frame.pose = None;
    None
}

fn found_points(frame: &Frame) -> HashSet<FeaturePointId> {
    frame.feature_points.iter().flatten().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint, ScalePyramid};
    use crate::vocabulary::tests::tiny;
    use crate::vocabulary::FEATURE_VECTOR_LEVELS_UP;
    use nalgebra::UnitQuaternion;
    use rand::{Rng, SeedableRng};

    fn camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    /// One keyframe at the origin observing `n` points, and the descriptors
    /// of those points.
    fn mapped_scene(n: usize) -> (Map, Vec<Vector3<f64>>, Vec<Descriptor>) {
        let cam = camera();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let points: Vec<Vector3<f64>> = (0..n)
            .map(|_| Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(4.0..7.0)))
            .collect();
        let descriptors: Vec<Descriptor> = (0..n).map(|_| rng.gen()).collect();
        let keypoints: Vec<KeyPoint> = points
            .iter()
            .map(|p| {
                let uv = cam.project(p).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect();

        let mut map = Map::new(ScalePyramid::new(1.2, 8));
        let origin = KeyframeId::new(0);
        let ids: Vec<FeaturePointId> = points
            .iter()
            .zip(&descriptors)
            .map(|(p, d)| map.insert_feature_point(*p, *d, origin, 0.0))
            .collect();
        let observations: Vec<(usize, FeaturePointId)> = ids.iter().copied().enumerate().collect();
        let kf = map.insert_keyframe(0.0, SE3::identity(), keypoints, descriptors.clone(), &observations);
        let (bow, feat) = tiny().transform(&descriptors, FEATURE_VECTOR_LEVELS_UP);
        map.attach_bow(kf, bow, feat);
        for id in ids {
            map.refresh_feature_point(id);
        }
        (map, points, descriptors)
    }

    fn frame_at(pose_wc: &SE3, points: &[Vector3<f64>], descriptors: &[Descriptor]) -> Frame {
        let cam = camera();
        let pose_cw = pose_wc.inverse();
        let keypoints = points
            .iter()
            .map(|p| {
                let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect();
        let features = FeatureSet {
            keypoints,
            descriptors: descriptors.to_vec(),
        };
        let mut frame = Frame::new(1, 1.0, features, &cam);
        frame.compute_bow(&tiny());
        frame
    }

    #[test]
    fn test_relocalizes_against_keyframe() {
        let (map, points, descriptors) = mapped_scene(80);
        let truth = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0),
            Vector3::new(0.1, 0.0, -0.05),
        );
        let mut frame = frame_at(&truth, &points, &descriptors);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let kf = relocalize(&mut frame, &map, &camera(), &RelocalizationConfig::default(), &mut rng);
        assert_eq!(kf, Some(KeyframeId::new(0)));
        let pose = frame.pose.unwrap();
        assert!((pose.translation - truth.translation).norm() < 1e-4);
        assert!(frame.num_matches() >= 50);
    }

    #[test]
    fn test_fails_on_unrelated_frame() {
        let (map, points, _) = mapped_scene(80);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let other: Vec<Descriptor> = (0..points.len()).map(|_| rng.gen()).collect();
        let mut frame = frame_at(&SE3::identity(), &points, &other);

        let kf = relocalize(&mut frame, &map, &camera(), &RelocalizationConfig::default(), &mut rng);
        assert!(kf.is_none());
        assert!(frame.pose.is_none());
        assert_eq!(frame.num_matches(), 0);
    }
}
