//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! One call to [`Tracker::step`] advances the state machine by one frame:
//! - `NotInitialized`: two-view map initialization
//! - `Ok`: motion model or reference keyframe, then the local map
//! - `Lost`: relocalization against the keyframe database
//!
//! The map is read under the shared read lock while estimating the pose and
//! written in short windows: the per-frame bookkeeping commit and keyframe
//! insertion. New keyframes are handed to the map maintainer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use image::GrayImage;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::SlamConfig;
use crate::error::Result;
use crate::geometry::SE3;
use crate::local_mapping::{scene_median_depth, triangulate_new_points, MapMaintainer};
use crate::map::{FeaturePointId, KeyframeId, Map};
use crate::optimizer::optimize_frame_pose;
use crate::system::messages::NewKeyframeMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::{Camera, FeatureExtractor};
use crate::tracking::initializer::{Initializer, TwoViewReconstruction};
use crate::tracking::keyframe_decision::{KeyframeCandidate, KeyframeDecision};
use crate::tracking::matching::{
    project_in_frustum, search_by_bow, search_by_projection_last_frame, search_for_initialization,
    search_local_points, ProjectedPoint,
};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::relocalization::relocalize;
use crate::tracking::result::{TimingStats, TrackingMetrics, TrackingResult};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::TrackingState;
use crate::vocabulary::Vocabulary;

/// Ratio test for matching the reference keyframe by BoW.
const REFERENCE_NN_RATIO: f64 = 0.7;
/// Ratio test for initialization matches.
const INIT_NN_RATIO: f64 = 0.9;
/// Ratio test for the local-map projection search.
const LOCAL_MAP_NN_RATIO: f64 = 0.8;
/// Local-map search radius factor, widened right after relocalization.
const LOCAL_MAP_TH: f64 = 1.0;
const LOCAL_MAP_TH_AFTER_RELOCALIZATION: f64 = 5.0;

/// Where committed keyframes go.
pub enum KeyframeSink {
    /// The maintainer thread's inbound channel.
    Channel(Sender<NewKeyframeMsg>),
    /// Maintenance runs synchronously inside `track`.
    Inline(MapMaintainer),
}

/// Reference frame of a pending map initialization.
struct InitializationAttempt {
    reference: Frame,
    initializer: Initializer,
}

/// Main tracking structure.
pub struct Tracker {
    camera: Camera,
    config: SlamConfig,
    vocabulary: Arc<Vocabulary>,
    extractor: Box<dyn FeatureExtractor>,

    /// Shared state (map, maintainer flags).
    shared: Arc<SharedState>,
    sink: KeyframeSink,

    state: TrackingState,
    next_frame_id: u64,

    initialization: Option<InitializationAttempt>,
    last_frame: Option<Frame>,
    motion: MotionModel,
    kf_decision: KeyframeDecision,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyframeId>,
    last_keyframe_frame_id: u64,
    last_relocalization_frame_id: Option<u64>,

    /// Points projected into the current frame by the local-map search.
    visible_points: Vec<FeaturePointId>,
    /// Points flagged `matched_in_last_frame` in the map.
    matched_points: Vec<FeaturePointId>,

    rng: ChaCha8Rng,
}

impl Tracker {
    /// `fps_frames` is the keyframe timeout used when the configuration
    /// leaves `max_frames` at zero.
    pub fn new(
        camera: Camera,
        config: SlamConfig,
        fps_frames: u32,
        vocabulary: Arc<Vocabulary>,
        extractor: Box<dyn FeatureExtractor>,
        shared: Arc<SharedState>,
        sink: KeyframeSink,
    ) -> Self {
        let kf_decision = KeyframeDecision::new(&config.tracking, fps_frames);
        Self {
            camera,
            config,
            vocabulary,
            extractor,
            shared,
            sink,
            state: TrackingState::NoImagesYet,
            next_frame_id: 0,
            initialization: None,
            last_frame: None,
            motion: MotionModel::new(),
            kf_decision,
            reference_kf: None,
            last_keyframe_frame_id: 0,
            last_relocalization_frame_id: None,
            visible_points: Vec::new(),
            matched_points: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Points matched in the most recent frame.
    pub fn matched_points(&self) -> &[FeaturePointId] {
        &self.matched_points
    }

    /// Camera-to-world pose of the most recent tracked frame.
    pub fn last_frame_pose(&self) -> Option<SE3> {
        self.last_frame.as_ref().and_then(|f| f.pose)
    }

    /// Extract features from `image` and advance one step.
    pub fn track(&mut self, image: &GrayImage, timestamp: f64) -> Result<TrackingResult> {
        let t_start = Instant::now();
        let features = self.extractor.extract(image)?;
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        let frame = Frame::new(self.next_frame_id, timestamp, features, &self.camera);
        self.next_frame_id += 1;

        let mut result = self.step(frame);
        result.timing.extract_ms = extract_ms;
        result.timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    /// Advance the state machine with an already built frame.
    pub fn step(&mut self, mut frame: Frame) -> TrackingResult {
        let t_track = Instant::now();
        let previous_state = self.state;
        let mut metrics = TrackingMetrics {
            num_features: frame.num_features(),
            ..TrackingMetrics::default()
        };
        let mut timing = TimingStats::default();
        let mut keyframe_created = None;
        self.visible_points.clear();

        self.state = match self.state {
            TrackingState::NoImagesYet | TrackingState::NotInitialized => {
                match self.monocular_initialization(&mut frame) {
                    Some(kf_id) => {
                        keyframe_created = Some(kf_id);
                        TrackingState::Ok
                    }
                    None => TrackingState::NotInitialized,
                }
            }
            TrackingState::Ok => {
                if self.track_from_previous(&mut frame) && self.track_local_map(&mut frame) {
                    TrackingState::Ok
                } else {
                    TrackingState::Lost
                }
            }
            TrackingState::Lost => {
                if self.try_relocalize(&mut frame) && self.track_local_map(&mut frame) {
                    TrackingState::Ok
                } else {
                    TrackingState::Lost
                }
            }
        };
        metrics.num_matches = frame.num_matches();
        metrics.num_inliers = frame.inlier_matches().count();
        timing.track_ms = t_track.elapsed().as_secs_f64() * 1000.0;

        match self.state {
            TrackingState::Ok => {
                if let Some(pose) = frame.pose {
                    if previous_state == TrackingState::Ok {
                        self.motion.update(&pose);
                    } else {
                        self.motion.restart_from(&pose);
                    }
                }
                self.commit_frame(&frame);

                // The initialization frame is already a keyframe.
                if previous_state != TrackingState::NotInitialized && self.need_new_keyframe(&frame) {
                    let t_kf = Instant::now();
                    if let Some((kf_id, new_points)) = self.create_keyframe(&mut frame) {
                        keyframe_created = Some(kf_id);
                        metrics.new_points = new_points;
                    }
                    timing.keyframe_ms = t_kf.elapsed().as_secs_f64() * 1000.0;
                }
                frame.discard_outliers();
            }
            TrackingState::Lost => {
                self.motion.reset();
                frame.clear_matches();
                frame.pose = None;
                self.commit_frame(&frame);
            }
            TrackingState::NoImagesYet | TrackingState::NotInitialized => {}
        }

        if previous_state != self.state {
            info!("[Tracker] frame {}: {} -> {}", frame.id, previous_state, self.state);
        }

        let pose = if self.state == TrackingState::Ok { frame.pose } else { None };
        let result = TrackingResult {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            previous_state,
            state: self.state,
            pose,
            reference_keyframe: self.reference_kf,
            keyframe_created,
            metrics,
            timing,
        };
        if self.state == TrackingState::Ok {
            self.last_frame = Some(frame);
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Two-view initialization. Returns the second keyframe on success.
    fn monocular_initialization(&mut self, frame: &mut Frame) -> Option<KeyframeId> {
        let cfg = self.config.initializer.clone();

        if self.initialization.is_none() {
            if frame.num_features() > cfg.min_features {
                debug!("[Tracker] frame {} is the initialization reference", frame.id);
                self.initialization = Some(InitializationAttempt {
                    initializer: Initializer::new(&frame.keypoints, &cfg),
                    reference: frame.clone(),
                });
            }
            return None;
        }
        if frame.num_features() <= cfg.min_features {
            self.initialization = None;
            return None;
        }

        let attempt = self.initialization.as_mut()?;
        let matches = search_for_initialization(
            &attempt.reference,
            frame,
            &mut attempt.initializer.prev_matched,
            cfg.search_window,
            INIT_NN_RATIO,
        );
        let num_matches = matches.iter().filter(|m| m.is_some()).count();
        if num_matches < cfg.min_matches {
            debug!("[Tracker] only {} initialization matches, dropping reference", num_matches);
            self.initialization = None;
            return None;
        }

        let reconstruction =
            attempt
                .initializer
                .initialize(&frame.keypoints, &matches, &self.camera, &mut self.rng)?;

        let attempt = self.initialization.take()?;
        let kf_id = self.create_initial_map(attempt.reference, frame, &matches, reconstruction);
        if kf_id.is_none() {
            self.reset();
        }
        kf_id
    }

    /// Insert both initialization keyframes with the triangulated points and
    /// normalize the scene to unit median depth.
    fn create_initial_map(
        &mut self,
        mut reference: Frame,
        frame: &mut Frame,
        matches: &[Option<usize>],
        reconstruction: TwoViewReconstruction,
    ) -> Option<KeyframeId> {
        reference.compute_bow(&self.vocabulary);
        frame.compute_bow(&self.vocabulary);
        frame.clear_matches();

        let mut map = self.shared.map.write();
        let kf_ini = map.insert_keyframe(
            reference.timestamp,
            SE3::identity(),
            reference.keypoints.clone(),
            reference.descriptors.clone(),
            &[],
        );
        map.attach_bow(kf_ini, reference.bow_vector.clone(), reference.feature_vector.clone());

        let mut observations = Vec::new();
        for (i1, point) in reconstruction.points.iter().enumerate() {
            let (Some(position), Some(Some(i2))) = (point, matches.get(i1)) else {
                continue;
            };
            let fp_id = map.insert_feature_point(*position, reference.descriptors[i1], kf_ini, reference.timestamp);
            if !map.associate(kf_ini, i1, fp_id) {
                map.erase_feature_point(fp_id);
                continue;
            }
            observations.push((*i2, fp_id));
        }
        // Inserted after the points so it links below the first keyframe.
        let kf_cur = map.insert_keyframe(
            frame.timestamp,
            reconstruction.pose_cw.inverse(),
            frame.keypoints.clone(),
            frame.descriptors.clone(),
            &observations,
        );
        map.attach_bow(kf_cur, frame.bow_vector.clone(), frame.feature_vector.clone());
        for &(i2, fp_id) in &observations {
            map.refresh_feature_point(fp_id);
            frame.feature_points[i2] = Some(fp_id);
        }

        let median_depth = scene_median_depth(&map, kf_ini).unwrap_or(-1.0);
        let tracked = map.tracked_points(kf_cur, 1);
        if median_depth <= 0.0 || tracked < self.config.initializer.min_tracked_points {
            warn!(
                "[Tracker] initial map rejected (median depth {:.3}, {} tracked points)",
                median_depth, tracked
            );
            return None;
        }
        map.rescale(1.0 / median_depth);
        let pose = map.keyframe(kf_cur).map(|kf| kf.pose)?;
        let points = map.point_count();
        drop(map);

        frame.set_pose(pose);
        self.reference_kf = Some(kf_cur);
        self.last_keyframe_frame_id = frame.id;
        info!(
            "[Tracker] map initialized with {} points ({:?}, parallax {:.2}°)",
            points, reconstruction.model, reconstruction.parallax_deg
        );
        Some(kf_cur)
    }

    /// Drop the map and start over.
    pub fn reset(&mut self) {
        info!("[Tracker] reset");
        self.shared.map.write().clear();
        self.state = TrackingState::NoImagesYet;
        self.initialization = None;
        self.last_frame = None;
        self.motion.reset();
        self.reference_kf = None;
        self.last_relocalization_frame_id = None;
        self.visible_points.clear();
        self.matched_points.clear();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    fn recently_relocalized(&self, frame_id: u64, window: u64) -> bool {
        self.last_relocalization_frame_id
            .map_or(false, |reloc| frame_id < reloc + window)
    }

    /// First pose estimate: motion model, falling back to the reference
    /// keyframe.
    fn track_from_previous(&mut self, frame: &mut Frame) -> bool {
        let use_motion = self.motion.has_velocity() && !self.recently_relocalized(frame.id, 2);
        if use_motion && self.track_with_motion_model(frame) {
            return true;
        }
        self.track_reference_keyframe(frame)
    }

    fn track_with_motion_model(&self, frame: &mut Frame) -> bool {
        let cfg = &self.config.tracking;
        let (Some(last), Some(predicted)) = (self.last_frame.as_ref(), self.motion.predict()) else {
            return false;
        };
        frame.clear_matches();
        frame.set_pose(predicted);

        let map = self.shared.map.read();
        let th = cfg.motion_search_radius;
        let mut matches = search_by_projection_last_frame(frame, last, &map, &self.camera, th);
        if matches < cfg.min_motion_matches {
            frame.clear_matches();
            matches = search_by_projection_last_frame(frame, last, &map, &self.camera, 2.0 * th);
        }
        if matches < cfg.min_motion_matches {
            debug!("[Tracker] motion model: {} matches", matches);
            frame.clear_matches();
            return false;
        }

        let inliers = optimize_frame_pose(frame, &map, &self.camera);
        frame.discard_outliers();
        debug!("[Tracker] motion model: {} matches, {} inliers", matches, inliers);
        inliers >= cfg.min_map_matches
    }

    fn track_reference_keyframe(&self, frame: &mut Frame) -> bool {
        let cfg = &self.config.tracking;
        let map = self.shared.map.read();
        let Some(kf) = self.reference_kf.and_then(|id| map.keyframe(id)) else {
            return false;
        };
        frame.compute_bow(&self.vocabulary);

        let matches = search_by_bow(kf, frame, &map, REFERENCE_NN_RATIO);
        let count = matches.iter().filter(|m| m.is_some()).count();
        if count < cfg.min_reference_matches {
            debug!("[Tracker] reference keyframe {}: {} matches", kf.id, count);
            return false;
        }

        frame.clear_matches();
        frame.feature_points = matches;
        let initial = self.last_frame_pose().unwrap_or(kf.pose);
        frame.set_pose(initial);

        let inliers = optimize_frame_pose(frame, &map, &self.camera);
        frame.discard_outliers();
        debug!("[Tracker] reference keyframe {}: {} matches, {} inliers", kf.id, count, inliers);
        inliers >= cfg.min_map_matches
    }

    /// Extend the matches with the local map and re-optimize.
    fn track_local_map(&mut self, frame: &mut Frame) -> bool {
        let cfg = &self.config.tracking;
        let (Some(pose_cw), Some(center)) = (frame.pose_cw(), frame.camera_center()) else {
            return false;
        };
        let map = self.shared.map.read();

        let matched: Vec<FeaturePointId> = frame.inlier_matches().map(|(_, id)| id).collect();
        let local = map.local_keyframes(matched.iter().copied(), cfg.local_map_keyframes, cfg.local_map_neighbors);
        if local.reference.is_some() {
            self.reference_kf = local.reference;
        }

        let already: HashSet<FeaturePointId> = matched.iter().copied().collect();
        let projected: Vec<ProjectedPoint> = map
            .points_of_keyframes(&local.keyframes)
            .into_iter()
            .filter(|id| !already.contains(id))
            .filter_map(|id| map.good_feature_point(id))
            .filter_map(|fp| project_in_frustum(fp, &pose_cw, &center, &self.camera, map.pyramid()))
            .collect();

        let th = if self.recently_relocalized(frame.id, 2) {
            LOCAL_MAP_TH_AFTER_RELOCALIZATION
        } else {
            LOCAL_MAP_TH
        };
        let found = search_local_points(frame, &projected, &map, th, LOCAL_MAP_NN_RATIO);
        let inliers = optimize_frame_pose(frame, &map, &self.camera);
        drop(map);

        self.visible_points = matched;
        self.visible_points.extend(projected.iter().map(|p| p.id));

        let required = if self.recently_relocalized(frame.id, self.kf_decision.max_frames()) {
            cfg.min_inliers_after_relocalization
        } else {
            cfg.min_inliers
        };
        debug!(
            "[Tracker] local map: {} keyframes, {} projected, {} new matches, {} inliers (need {})",
            local.keyframes.len(),
            projected.len(),
            found,
            inliers,
            required
        );
        inliers >= required
    }

    fn try_relocalize(&mut self, frame: &mut Frame) -> bool {
        frame.compute_bow(&self.vocabulary);
        let found = {
            let map = self.shared.map.read();
            relocalize(frame, &map, &self.camera, &self.config.relocalization, &mut self.rng)
        };
        match found {
            Some(kf_id) => {
                info!("[Tracker] frame {} relocalized against {}", frame.id, kf_id);
                self.last_relocalization_frame_id = Some(frame.id);
                self.reference_kf = Some(kf_id);
                true
            }
            None => false,
        }
    }

    /// Per-frame map bookkeeping: visibility counters and the matched flags.
    fn commit_frame(&mut self, frame: &Frame) {
        let mut map = self.shared.map.write();
        for id in self.matched_points.drain(..) {
            if let Some(fp) = map.feature_point_mut(id) {
                fp.matched_in_last_frame = false;
            }
        }
        for &id in &self.visible_points {
            if let Some(fp) = map.feature_point_mut(id) {
                fp.increase_visible(1);
            }
        }
        for (_, id) in frame.inlier_matches() {
            let Some(fp) = map.feature_point_mut(id) else {
                continue;
            };
            if fp.is_bad {
                continue;
            }
            fp.increase_found(1);
            fp.matched_in_last_frame = true;
            self.matched_points.push(id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────────

    fn need_new_keyframe(&self, frame: &Frame) -> bool {
        let Some(pose) = frame.pose else {
            return false;
        };
        let map = self.shared.map.read();
        let keyframes_in_map = map.keyframe_count();
        let reference_tracked_points = self.reference_kf.map_or(0, |id| {
            map.tracked_points(id, KeyframeDecision::min_observations(keyframes_in_map))
        });
        let (translation, rotation) = map
            .last_keyframe_id()
            .and_then(|id| map.keyframe(id))
            .map(|kf| {
                let delta = kf.pose.inverse().compose(&pose);
                (delta.translation.norm(), delta.angle().to_degrees())
            })
            .unwrap_or((f64::INFINITY, f64::INFINITY));

        self.kf_decision.should_create(&KeyframeCandidate {
            frame_id: frame.id,
            last_keyframe_frame_id: self.last_keyframe_frame_id,
            last_relocalization_frame_id: self.last_relocalization_frame_id.unwrap_or(0),
            keyframes_in_map,
            tracked_inliers: frame.inlier_matches().count(),
            reference_tracked_points,
            maintainer_idle: self.shared.is_maintainer_idle(),
            translation_since_keyframe: translation,
            rotation_since_keyframe_deg: rotation,
        })
    }

    /// Insert the frame as a keyframe with its inlier observations and the
    /// points triangulated against its covisible neighbors, then hand it to
    /// the maintainer.
    fn create_keyframe(&mut self, frame: &mut Frame) -> Option<(KeyframeId, usize)> {
        let pose = frame.pose?;
        frame.compute_bow(&self.vocabulary);

        let msg = {
            let mut map = self.shared.map.write();
            let observations: Vec<(usize, FeaturePointId)> = frame
                .inlier_matches()
                .filter(|(_, id)| map.good_feature_point(*id).is_some())
                .collect();
            let kf_id = insert_tracked_keyframe(&mut map, frame, pose, &observations);
            let report = triangulate_new_points(
                &mut map,
                kf_id,
                &self.camera,
                self.config.mapping.triangulation_neighbors,
            );
            NewKeyframeMsg {
                keyframe_id: kf_id,
                new_points: report.created,
            }
        };

        let kf_id = msg.keyframe_id;
        let new_points = msg.new_points.len();
        self.reference_kf = Some(kf_id);
        self.last_keyframe_frame_id = frame.id;
        debug!("[Tracker] frame {} -> {} with {} new points", frame.id, kf_id, new_points);

        match &mut self.sink {
            KeyframeSink::Channel(sender) => {
                if sender.send(msg).is_err() {
                    warn!("[Tracker] map maintainer is gone; {} will not be maintained", kf_id);
                }
            }
            KeyframeSink::Inline(maintainer) => {
                maintainer.process(msg, &self.shared);
            }
        }
        Some((kf_id, new_points))
    }
}

fn insert_tracked_keyframe(
    map: &mut Map,
    frame: &Frame,
    pose: SE3,
    observations: &[(usize, FeaturePointId)],
) -> KeyframeId {
    let kf_id = map.insert_keyframe(
        frame.timestamp,
        pose,
        frame.keypoints.clone(),
        frame.descriptors.clone(),
        observations,
    );
    map.attach_bow(kf_id, frame.bow_vector.clone(), frame.feature_vector.clone());
    for &(_, fp_id) in observations {
        map.refresh_feature_point(fp_id);
    }
    kf_id
}
