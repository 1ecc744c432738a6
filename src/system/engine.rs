//! Engine: the top-level entry point.
//!
//! The `Engine` owns one independent SLAM session: the shared map, the
//! tracker (driven in the caller's thread by [`Engine::track`]) and, in
//! threaded mode, the map maintainer thread. It also keeps the pose history
//! and the feature point snapshots exposed to callers.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use image::DynamicImage;
use nalgebra::Vector3;
use tracing::{info, warn};

use crate::config::{MaintenanceMode, Settings};
use crate::error::{checked_index, Result, SlamError};
use crate::local_mapping::MapMaintainer;
use crate::map::{CullPolicy, FeaturePoint, FeaturePointId, Map};
use crate::tracking::frame::{FeatureExtractor, ScalePyramid};
use crate::tracking::result::TrackingResult;
use crate::tracking::tracker::{KeyframeSink, Tracker};
use crate::tracking::TrackingState;
use crate::vocabulary::Vocabulary;

use super::messages::{NewKeyframeMsg, TimedImage};
use super::pose_history::{PoseHistory, StampedPose};
use super::shared_state::SharedState;

/// Capacity of the keyframe channel between the tracker and the maintainer.
/// When the channel is full, tracking will block briefly.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Read-only copy of a feature point taken after a `track` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePointView {
    pub id: FeaturePointId,
    pub position: Vector3<f64>,
    /// Timestamp of the frame that created the point.
    pub timestamp: f64,
    pub observations: usize,
    pub matched_in_last_frame: bool,
}

impl From<&FeaturePoint> for FeaturePointView {
    fn from(fp: &FeaturePoint) -> Self {
        Self {
            id: fp.id,
            position: fp.position,
            timestamp: fp.timestamp,
            observations: fp.num_observations(),
            matched_in_last_frame: fp.matched_in_last_frame,
        }
    }
}

/// A monocular SLAM session.
pub struct Engine {
    /// Shared state (map, flags) accessible by the maintainer thread.
    shared: Arc<SharedState>,

    /// The tracker runs in the caller's thread.
    tracker: Tracker,

    /// Handle to the maintainer thread, if maintenance is threaded.
    maintainer_handle: Option<JoinHandle<()>>,

    history: PoseHistory,
    last_timestamp: Option<f64>,
    last_result: Option<TrackingResult>,
    shut_down: bool,

    /// Points matched in the latest frame.
    matched: Vec<FeaturePointView>,
    /// Every good point in the map.
    all: Vec<FeaturePointView>,
}

impl Engine {
    /// Load the vocabulary and settings and start a session.
    ///
    /// The viewer and semi-dense reconstruction are not part of this engine;
    /// requesting them only logs a warning.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        vocabulary_path: P,
        settings_path: Q,
        enable_viewer: bool,
        enable_semi_dense: bool,
    ) -> Result<Self> {
        let vocabulary_path = vocabulary_path.as_ref();
        info!("Loading vocabulary from {}", vocabulary_path.display());
        let vocabulary = Vocabulary::load(vocabulary_path).map_err(|source| SlamError::Vocabulary {
            path: vocabulary_path.to_path_buf(),
            source,
        })?;
        let settings = Settings::load(settings_path)?;

        if enable_viewer {
            warn!("No viewer is available; continuing without one");
        }
        if enable_semi_dense {
            warn!("Semi-dense reconstruction is not supported; continuing with the sparse map");
        }

        let extractor = default_extractor(&settings)?;
        Ok(Self::with_parts(Arc::new(vocabulary), settings, extractor))
    }

    /// Start a session from already loaded collaborators.
    pub fn with_parts(
        vocabulary: Arc<Vocabulary>,
        settings: Settings,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Self {
        let config = settings.tuning.clone();
        let camera = settings.camera();
        let pyramid = ScalePyramid::new(settings.orb.scale_factor, settings.orb.num_levels);
        let map = Map::new(pyramid).with_cull_policy(CullPolicy {
            redundancy_ratio: config.mapping.redundancy_ratio,
            redundant_observers: config.mapping.redundant_observers,
        });
        let shared = SharedState::new(map);

        let maintainer = MapMaintainer::new(camera, config.mapping.clone());
        let (sink, maintainer_handle) = match config.mapping.mode {
            MaintenanceMode::Threaded => {
                let (kf_sender, kf_receiver) = bounded::<NewKeyframeMsg>(KEYFRAME_CHANNEL_CAPACITY);
                let handle = Self::spawn_maintainer(maintainer, kf_receiver, Arc::clone(&shared));
                (KeyframeSink::Channel(kf_sender), Some(handle))
            }
            MaintenanceMode::Inline => (KeyframeSink::Inline(maintainer), None),
        };

        let tracker = Tracker::new(
            camera,
            config,
            settings.max_frames(),
            vocabulary,
            extractor,
            Arc::clone(&shared),
            sink,
        );
        info!(
            "Engine ready ({}x{}, {} ORB levels, maintenance {:?})",
            settings.camera.width, settings.camera.height, settings.orb.num_levels, settings.tuning.mapping.mode
        );

        Self {
            shared,
            tracker,
            maintainer_handle,
            history: PoseHistory::new(),
            last_timestamp: None,
            last_result: None,
            shut_down: false,
            matched: Vec::new(),
            all: Vec::new(),
        }
    }

    fn spawn_maintainer(
        mut maintainer: MapMaintainer,
        receiver: Receiver<NewKeyframeMsg>,
        shared: Arc<SharedState>,
    ) -> JoinHandle<()> {
        thread::spawn(move || maintainer.run(receiver, shared))
    }

    /// Process one image. Timestamps must be finite and must not decrease.
    ///
    /// Losing track is not an error; it shows up in the returned state.
    pub fn track(&mut self, image: &DynamicImage, timestamp: f64) -> Result<TrackingState> {
        if self.shut_down {
            return Err(SlamError::ShutDown);
        }
        // NaN would compare false against every later timestamp.
        let previous = self.last_timestamp.unwrap_or(f64::NEG_INFINITY);
        if !timestamp.is_finite() || timestamp < previous {
            return Err(SlamError::NonMonotonicTimestamp {
                previous,
                current: timestamp,
            });
        }

        let gray = image.to_luma8();
        let result = self.tracker.track(&gray, timestamp)?;
        self.last_timestamp = Some(timestamp);

        if let Some(pose) = result.pose {
            self.history.push(StampedPose::new(timestamp, pose.inverse()));
        }
        self.refresh_snapshots();
        let state = result.state;
        self.last_result = Some(result);
        Ok(state)
    }

    fn refresh_snapshots(&mut self) {
        let map = self.shared.map.read();
        self.all = map
            .feature_points()
            .filter(|fp| !fp.is_bad)
            .map(FeaturePointView::from)
            .collect();
        self.matched = self
            .tracker
            .matched_points()
            .iter()
            .filter_map(|&id| map.good_feature_point(id))
            .map(FeaturePointView::from)
            .collect();
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Diagnostics of the latest `track` call.
    pub fn last_result(&self) -> Option<&TrackingResult> {
        self.last_result.as_ref()
    }

    /// Get a reference to the shared state (map and maintainer flags).
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn keyframe_count(&self) -> usize {
        self.shared.map.read().keyframe_count()
    }

    pub fn map_point_count(&self) -> usize {
        self.shared.map.read().point_count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Feature point snapshots, valid until the next `track`
    // ─────────────────────────────────────────────────────────────────────────

    pub fn matched_feature_points(&self) -> &[FeaturePointView] {
        &self.matched
    }

    pub fn all_feature_points(&self) -> &[FeaturePointView] {
        &self.all
    }

    pub fn matched_feature_point_count(&self) -> usize {
        self.matched.len()
    }

    pub fn feature_point_count(&self) -> usize {
        self.all.len()
    }

    pub fn matched_feature_point_at(&self, index: usize) -> Result<&FeaturePointView> {
        checked_index(&self.matched, index)
    }

    pub fn feature_point_at(&self, index: usize) -> Result<&FeaturePointView> {
        checked_index(&self.all, index)
    }

    /// Up to `n` matched points, closest to the last camera center first.
    pub fn nearest_matched_feature_points(&self, n: usize) -> Vec<FeaturePointView> {
        let Some(center) = self.history.last().map(StampedPose::position) else {
            return Vec::new();
        };
        let mut points = self.matched.clone();
        points.sort_by(|a, b| {
            let da = (a.position - center).norm_squared();
            let db = (b.position - center).norm_squared();
            da.total_cmp(&db)
        });
        points.truncate(n);
        points
    }

    pub fn first_feature_point(&self) -> Option<&FeaturePointView> {
        self.all.first()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose history
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pose_at(&self, index: usize) -> Result<&StampedPose> {
        self.history.get(index)
    }

    pub fn last_pose(&self) -> Option<&StampedPose> {
        self.history.last()
    }

    pub fn pose_count(&self) -> usize {
        self.history.len()
    }

    pub fn poses(&self) -> impl Iterator<Item = &StampedPose> {
        self.history.iter()
    }

    /// True once after each newly appended pose.
    pub fn pose_changed_since_last_query(&mut self) -> bool {
        self.history.take_changed()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Feed images from a channel until it closes, then shut down.
    ///
    /// Frames that cannot be processed (out-of-order timestamps, extractor
    /// failures) are logged and skipped.
    pub fn run(&mut self, inbound: Receiver<TimedImage>) -> Result<()> {
        let mut frames = 0usize;
        for TimedImage { image, timestamp } in inbound.iter() {
            match self.track(&image, timestamp) {
                Ok(_) => frames += 1,
                Err(e @ (SlamError::NonMonotonicTimestamp { .. } | SlamError::Extraction(_))) => {
                    warn!("Skipping frame at {:.6}: {}", timestamp, e);
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Input closed after {} frames ({} tracked poses, {} keyframes)",
            frames,
            self.pose_count(),
            self.keyframe_count()
        );
        self.shutdown();
        Ok(())
    }

    /// Stop the maintainer and refuse further frames. Calling it again has
    /// no effect.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.shared.request_shutdown();

        // The maintainer notices the flag at its next receive timeout.
        if let Some(handle) = self.maintainer_handle.take() {
            if handle.join().is_err() {
                warn!("Map maintainer thread panicked");
            }
        }
        info!("Engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("num_poses", &self.history.len())
            .field("last_timestamp", &self.last_timestamp)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// ORB extractor configured from the settings.
#[cfg(not(feature = "opencv"))]
fn default_extractor(settings: &Settings) -> Result<Box<dyn FeatureExtractor>> {
    Ok(Box::new(crate::tracking::frame::OrbExtractor::new(settings.orb.clone())))
}

/// ORB extractor configured from the settings.
#[cfg(feature = "opencv")]
fn default_extractor(settings: &Settings) -> Result<Box<dyn FeatureExtractor>> {
    let extractor = crate::tracking::frame::OpenCvOrbExtractor::new(&settings.orb)?;
    Ok(Box::new(extractor))
}
