//! Map maintainer: background upkeep of the map after each new keyframe.
//!
//! Each pass, under a single map write lock:
//! 1. Culls recently created points that tracking fails to find
//! 2. Refines the positions of the keyframe's well-observed points
//! 3. Runs `Map::cull` (redundant keyframes, then orphan or bad points)
//!
//! The pass runs either on its own thread, fed by a bounded channel, or
//! inline in the caller.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::config::MappingConfig;
use crate::map::{CullReport, FeaturePointId, KeyframeId, Map};
use crate::optimizer::{refine_point, PointObservation};
use crate::system::messages::NewKeyframeMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::Camera;

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Recent points with this many observations or fewer are culled once past
/// the first keyframe after their creation.
const MIN_RECENT_OBSERVATIONS: usize = 2;

/// Points need this many observers before their position is refined.
const MIN_REFINE_OBSERVATIONS: usize = 3;

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MaintenanceReport {
    pub recent_points_culled: usize,
    pub points_refined: usize,
    pub cull: CullReport,
}

pub struct MapMaintainer {
    camera: Camera,
    config: MappingConfig,
    /// Points under probation, with the keyframe that created them.
    recent_points: Vec<(FeaturePointId, KeyframeId)>,
    keyframes_processed: u64,
}

impl MapMaintainer {
    pub fn new(camera: Camera, config: MappingConfig) -> Self {
        Self {
            camera,
            config,
            recent_points: Vec::new(),
            keyframes_processed: 0,
        }
    }

    /// Thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, receiver: Receiver<NewKeyframeMsg>, shared: Arc<SharedState>) {
        info!("Map maintainer started");
        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    shared.set_maintainer_busy(true);
                    self.process(msg, &shared);
                    shared.set_maintainer_busy(false);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(
            "Map maintainer stopped after {} keyframes",
            self.keyframes_processed
        );
    }

    /// Run one maintenance pass for a committed keyframe.
    pub fn process(&mut self, msg: NewKeyframeMsg, shared: &SharedState) -> MaintenanceReport {
        let mut map = shared.map.write();
        self.process_map(msg, &mut map)
    }

    pub(crate) fn process_map(&mut self, msg: NewKeyframeMsg, map: &mut Map) -> MaintenanceReport {
        let kf_id = msg.keyframe_id;
        self.keyframes_processed += 1;
        if map.keyframe(kf_id).map_or(true, |kf| kf.is_bad) {
            debug!("[Maintainer] {} no longer in the map", kf_id);
            return MaintenanceReport::default();
        }
        self.recent_points
            .extend(msg.new_points.into_iter().map(|fp| (fp, kf_id)));

        let recent_points_culled = self.cull_recent_points(map, kf_id);
        let points_refined = self.refine_points(map, kf_id);
        let cull = map.cull();

        let report = MaintenanceReport {
            recent_points_culled,
            points_refined,
            cull,
        };
        debug!(
            "[Maintainer] {}: culled {} recent points, refined {}, removed {} keyframes / {} points",
            kf_id,
            report.recent_points_culled,
            report.points_refined,
            report.cull.keyframes_removed,
            report.cull.points_removed
        );
        report
    }

    /// Probation for freshly triangulated points. A point is flagged bad
    /// when tracking finds it in too few of the frames it should be visible
    /// in, or when it gathers too few observers shortly after creation.
    /// Points surviving the grace period leave probation.
    fn cull_recent_points(&mut self, map: &mut Map, current: KeyframeId) -> usize {
        let min_found_ratio = self.config.min_found_ratio;
        let grace = self.config.grace_keyframes;
        let mut culled = 0;

        self.recent_points.retain(|&(fp_id, origin)| {
            let Some(fp) = map.feature_point_mut(fp_id) else {
                return false;
            };
            if fp.is_bad {
                return false;
            }
            let age = current.0.saturating_sub(origin.0);
            if fp.found_ratio() < min_found_ratio
                || (age + 1 >= grace && fp.num_observations() <= MIN_RECENT_OBSERVATIONS)
            {
                fp.set_bad();
                culled += 1;
                return false;
            }
            age < grace
        });
        culled
    }

    /// Structure-only refinement of the keyframe's well-observed points.
    fn refine_points(&self, map: &mut Map, kf_id: KeyframeId) -> usize {
        let Some(kf) = map.keyframe(kf_id) else {
            return 0;
        };
        let pyramid = map.pyramid();
        let mut updates = Vec::new();
        for (_, fp_id) in kf.feature_point_indices() {
            let Some(fp) = map.good_feature_point(fp_id) else {
                continue;
            };
            if fp.num_observations() < MIN_REFINE_OBSERVATIONS {
                continue;
            }
            let observations: Vec<PointObservation> = fp
                .observations
                .iter()
                .filter_map(|(obs_kf, &idx)| {
                    let obs_kf = map.keyframe(*obs_kf).filter(|k| !k.is_bad)?;
                    let kp = obs_kf.keypoints.get(idx)?;
                    Some(PointObservation {
                        pose_cw: obs_kf.pose_cw(),
                        uv: kp.pt,
                        inv_sigma2: 1.0 / pyramid.sigma2(kp.octave),
                    })
                })
                .collect();
            if let Some(refined) = refine_point(&fp.position, &observations, &self.camera, self.config.refine_patience) {
                updates.push((fp_id, refined));
            }
        }

        let refined = updates.len();
        for (fp_id, position) in updates {
            if let Some(fp) = map.feature_point_mut(fp_id) {
                fp.position = position;
            }
            map.refresh_feature_point(fp_id);
        }
        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::{Descriptor, KeyPoint, ScalePyramid};
    use nalgebra::{UnitQuaternion, Vector3};

    fn camera() -> Camera {
        Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    /// `n_kf` keyframes stepping along x, all observing the same points.
    fn scene(n_kf: usize, points: &[Vector3<f64>]) -> (Map, Vec<KeyframeId>, Vec<FeaturePointId>) {
        let cam = camera();
        let mut map = Map::new(ScalePyramid::new(1.2, 8));
        let ids: Vec<FeaturePointId> = points
            .iter()
            .enumerate()
            .map(|(i, p)| map.insert_feature_point(*p, [i as u8; 32], KeyframeId::new(0), 0.0))
            .collect();
        let observations: Vec<(usize, FeaturePointId)> = ids.iter().copied().enumerate().collect();
        let mut kfs = Vec::new();
        for k in 0..n_kf {
            let pose = SE3::from_quaternion(UnitQuaternion::identity(), Vector3::new(0.2 * k as f64, 0.0, 0.0));
            let pose_cw = pose.inverse();
            let keypoints: Vec<KeyPoint> = points
                .iter()
                .map(|p| {
                    let uv = cam.project(&pose_cw.transform_point(p)).unwrap();
                    KeyPoint::new(uv.x, uv.y, 0)
                })
                .collect();
            let descriptors: Vec<Descriptor> = (0..points.len()).map(|i| [i as u8; 32]).collect();
            kfs.push(map.insert_keyframe(k as f64, pose, keypoints, descriptors, &observations));
        }
        for &id in &ids {
            map.refresh_feature_point(id);
        }
        (map, kfs, ids)
    }

    fn grid_points() -> Vec<Vector3<f64>> {
        (0..20)
            .map(|i| Vector3::new(-1.0 + 0.1 * i as f64, 0.05 * (i % 4) as f64, 4.0 + 0.1 * (i % 5) as f64))
            .collect()
    }

    #[test]
    fn test_refines_perturbed_points() {
        let truth = grid_points();
        let (mut map, kfs, ids) = scene(3, &truth);
        for &id in &ids {
            map.feature_point_mut(id).unwrap().position += Vector3::new(0.02, -0.01, 0.1);
        }
        let mut maintainer = MapMaintainer::new(camera(), MappingConfig::default());
        let report = maintainer.process_map(
            NewKeyframeMsg {
                keyframe_id: kfs[2],
                new_points: Vec::new(),
            },
            &mut map,
        );
        assert_eq!(report.points_refined, truth.len());
        for (id, p) in ids.iter().zip(&truth) {
            assert!((map.feature_point(*id).unwrap().position - p).norm() < 1e-5);
        }
    }

    #[test]
    fn test_recent_point_probation() {
        let truth = grid_points();
        let (mut map, kfs, ids) = scene(3, &truth);
        let mut maintainer = MapMaintainer::new(camera(), MappingConfig::default());

        // Rarely found point.
        map.feature_point_mut(ids[0]).unwrap().increase_visible(10);
        // Point seen by a single keyframe.
        map.disassociate(kfs[0], ids[1]);
        map.disassociate(kfs[1], ids[1]);

        maintainer.process_map(
            NewKeyframeMsg {
                keyframe_id: kfs[0],
                new_points: vec![ids[0], ids[1], ids[2]],
            },
            &mut map,
        );
        assert!(map.feature_point(ids[0]).map_or(true, |fp| fp.is_bad));
        // Still inside the grace period.
        assert!(map.good_feature_point(ids[1]).is_some());
        assert_eq!(maintainer.recent_points.len(), 2);

        let kf3 = map.insert_keyframe(3.0, SE3::identity(), Vec::new(), Vec::new(), &[]);
        let report = maintainer.process_map(
            NewKeyframeMsg {
                keyframe_id: kf3,
                new_points: Vec::new(),
            },
            &mut map,
        );
        assert_eq!(report.recent_points_culled, 1);
        assert!(map.feature_point(ids[1]).map_or(true, |fp| fp.is_bad));
        // Well observed: leaves probation.
        assert!(map.good_feature_point(ids[2]).is_some());
        assert!(maintainer.recent_points.is_empty());
    }

    #[test]
    fn test_threaded_loop_exits_on_disconnect() {
        let shared = SharedState::new(Map::default());
        let (tx, rx) = crossbeam_channel::bounded::<NewKeyframeMsg>(4);
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            MapMaintainer::new(camera(), MappingConfig::default()).run(rx, worker_shared);
        });
        tx.send(NewKeyframeMsg {
            keyframe_id: KeyframeId::new(7),
            new_points: Vec::new(),
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();
        assert!(shared.is_maintainer_idle());
    }
}
