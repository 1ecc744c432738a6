//! Settings file loading and tunable thresholds.
//!
//! The settings file follows the ORB-SLAM2 YAML layout (`Camera.fx`,
//! `ORBextractor.nFeatures`, ...). An optional `Tuning` section overrides the
//! defaults of [`SlamConfig`].

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SlamError};
use crate::tracking::frame::Camera;

/// Pinhole intrinsics and radial-tangential distortion.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
    #[serde(rename = "Camera.fx")]
    pub fx: f64,
    #[serde(rename = "Camera.fy")]
    pub fy: f64,
    #[serde(rename = "Camera.cx")]
    pub cx: f64,
    #[serde(rename = "Camera.cy")]
    pub cy: f64,
    #[serde(rename = "Camera.k1", default)]
    pub k1: f64,
    #[serde(rename = "Camera.k2", default)]
    pub k2: f64,
    #[serde(rename = "Camera.p1", default)]
    pub p1: f64,
    #[serde(rename = "Camera.p2", default)]
    pub p2: f64,
    #[serde(rename = "Camera.k3", default)]
    pub k3: f64,
    #[serde(rename = "Camera.width", default = "default_width")]
    pub width: u32,
    #[serde(rename = "Camera.height", default = "default_height")]
    pub height: u32,
    #[serde(rename = "Camera.fps", default = "default_fps")]
    pub fps: f64,
    /// 1 if color input is RGB ordered, 0 for BGR.
    #[serde(rename = "Camera.RGB", default = "default_rgb")]
    pub rgb: i32,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> f64 {
    30.0
}

fn default_rgb() -> i32 {
    1
}

/// ORB extractor parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct OrbParams {
    #[serde(rename = "ORBextractor.nFeatures", default = "default_n_features")]
    pub num_features: usize,
    #[serde(rename = "ORBextractor.scaleFactor", default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(rename = "ORBextractor.nLevels", default = "default_n_levels")]
    pub num_levels: usize,
    #[serde(rename = "ORBextractor.iniThFAST", default = "default_ini_th_fast")]
    pub ini_th_fast: u8,
    #[serde(rename = "ORBextractor.minThFAST", default = "default_min_th_fast")]
    pub min_th_fast: u8,
}

fn default_n_features() -> usize {
    1000
}

fn default_scale_factor() -> f64 {
    1.2
}

fn default_n_levels() -> usize {
    8
}

fn default_ini_th_fast() -> u8 {
    20
}

fn default_min_th_fast() -> u8 {
    7
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            num_features: default_n_features(),
            scale_factor: default_scale_factor(),
            num_levels: default_n_levels(),
            ini_th_fast: default_ini_th_fast(),
            min_th_fast: default_min_th_fast(),
        }
    }
}

/// Everything read from a settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub camera: CameraSettings,
    #[serde(flatten)]
    pub orb: OrbParams,
    #[serde(rename = "Tuning", default)]
    pub tuning: SlamConfig,
}

impl Settings {
    /// Load and validate a settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SlamError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|reason| SlamError::Settings {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse settings text. OpenCV's `%YAML:1.0` directive is skipped since
    /// it is not valid YAML 1.2.
    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, String> {
        let body: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("%YAML"))
            .collect::<Vec<_>>()
            .join("\n");
        let settings: Settings = serde_yaml::from_str(&body).map_err(|e| e.to_string())?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let c = &self.camera;
        if !(c.fx > 0.0 && c.fy > 0.0) {
            return Err(format!("focal lengths must be positive (fx={}, fy={})", c.fx, c.fy));
        }
        if c.width == 0 || c.height == 0 {
            return Err("image size must be non-zero".into());
        }
        if !(c.fps > 0.0) {
            return Err(format!("Camera.fps must be positive, got {}", c.fps));
        }
        if self.orb.scale_factor <= 1.0 || self.orb.num_levels == 0 {
            return Err("ORBextractor.scaleFactor must be > 1 and nLevels >= 1".into());
        }
        Ok(())
    }

    /// Camera model built from the intrinsics.
    pub fn camera(&self) -> Camera {
        let c = &self.camera;
        Camera::new(c.fx, c.fy, c.cx, c.cy, c.width, c.height)
            .with_distortion([c.k1, c.k2, c.p1, c.p2, c.k3])
    }

    /// Maximum number of frames between keyframes (one second of video).
    pub fn max_frames(&self) -> u32 {
        self.camera.fps.round().max(1.0) as u32
    }
}

/// Tunable thresholds for every stage of the pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub tracking: TrackingConfig,
    pub initializer: InitializerConfig,
    pub mapping: MappingConfig,
    pub relocalization: RelocalizationConfig,
}

/// Thresholds used while in the `Ok` state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Projection search radius (pixels at level 0) for the motion model.
    pub motion_search_radius: f64,
    /// Below this many motion-model matches the radius is doubled, and if
    /// still below, the reference keyframe is matched instead.
    pub min_motion_matches: usize,
    /// Minimum BoW matches against the reference keyframe.
    pub min_reference_matches: usize,
    /// Minimum inliers after the first pose refinement.
    pub min_map_matches: usize,
    /// Local-map inliers needed to stay `Ok`.
    pub min_inliers: usize,
    /// Local-map inliers needed shortly after a relocalization.
    pub min_inliers_after_relocalization: usize,
    /// Maximum number of keyframes in the local map.
    pub local_map_keyframes: usize,
    /// Covisible neighbors added per local keyframe.
    pub local_map_neighbors: usize,
    /// Keyframe insertion: fraction of reference points that must be tracked.
    pub keyframe_tracked_ratio: f64,
    /// Keyframe insertion: minimum frames between keyframes.
    pub min_frames: u32,
    /// Keyframe insertion: forced after this many frames. Zero means `Camera.fps`.
    pub max_frames: u32,
    /// Minimum camera translation (map units) since the last keyframe.
    pub min_keyframe_translation: f64,
    /// Minimum camera rotation (degrees) since the last keyframe.
    pub min_keyframe_rotation_deg: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            motion_search_radius: 15.0,
            min_motion_matches: 20,
            min_reference_matches: 15,
            min_map_matches: 10,
            min_inliers: 30,
            min_inliers_after_relocalization: 50,
            local_map_keyframes: 80,
            local_map_neighbors: 10,
            keyframe_tracked_ratio: 0.9,
            min_frames: 0,
            max_frames: 0,
            min_keyframe_translation: 0.01,
            min_keyframe_rotation_deg: 2.0,
        }
    }
}

/// Two-view map initialization parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    /// Keypoints a frame needs to become an initialization reference.
    pub min_features: usize,
    /// Matches between the reference and current frame.
    pub min_matches: usize,
    /// Points that must triangulate with the selected model.
    pub min_triangulated: usize,
    /// Points the second keyframe must track after map creation.
    pub min_tracked_points: usize,
    /// Minimum triangulation parallax in degrees.
    pub min_parallax_deg: f64,
    /// Keypoint standard deviation at level 0 (pixels).
    pub sigma: f64,
    /// RANSAC iterations for both models.
    pub ransac_iterations: usize,
    /// Matching window (pixels) around the reference keypoint.
    pub search_window: f64,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            min_features: 40,
            min_matches: 40,
            min_triangulated: 40,
            min_tracked_points: 40,
            min_parallax_deg: 1.0,
            sigma: 1.0,
            ransac_iterations: 200,
            search_window: 100.0,
        }
    }
}

/// Whether map maintenance runs on its own thread or inside `track`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MaintenanceMode {
    Threaded,
    Inline,
}

/// Map maintenance and triangulation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub mode: MaintenanceMode,
    /// Recent points with found/visible below this ratio are culled.
    pub min_found_ratio: f64,
    /// Keyframes a new point has to survive before it is considered mature.
    pub grace_keyframes: u64,
    /// A keyframe is redundant when this fraction of its points is well observed.
    pub redundancy_ratio: f64,
    /// Other keyframes that must see a point for it to count as well observed.
    pub redundant_observers: usize,
    /// Covisible keyframes used for triangulating new points.
    pub triangulation_neighbors: usize,
    /// Levenberg-Marquardt evaluations when refining a point.
    pub refine_patience: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            mode: MaintenanceMode::Threaded,
            min_found_ratio: 0.25,
            grace_keyframes: 3,
            redundancy_ratio: 0.9,
            redundant_observers: 3,
            triangulation_neighbors: 20,
            refine_patience: 10,
        }
    }
}

/// Recovery after tracking loss.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelocalizationConfig {
    /// Candidates must score at least this fraction of the best candidate.
    pub candidate_score_ratio: f64,
    /// BoW matches a candidate keyframe must provide.
    pub min_bow_matches: usize,
    /// P3P RANSAC iterations per candidate.
    pub ransac_iterations: usize,
    /// Inliers P3P RANSAC must find before refinement.
    pub min_ransac_inliers: usize,
    /// Inliers required to declare relocalization successful.
    pub min_inliers: usize,
}

impl Default for RelocalizationConfig {
    fn default() -> Self {
        Self {
            candidate_score_ratio: 0.75,
            min_bow_matches: 15,
            ransac_iterations: 300,
            min_ransac_inliers: 10,
            min_inliers: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = "%YAML:1.0

Camera.fx: 517.306408
Camera.fy: 516.469215
Camera.cx: 318.643040
Camera.cy: 255.313989
Camera.k1: 0.262383
Camera.k2: -0.953104
Camera.p1: -0.005358
Camera.p2: 0.002628
Camera.k3: 1.163314
Camera.width: 640
Camera.height: 480
Camera.fps: 30.0
Camera.RGB: 1

ORBextractor.nFeatures: 1000
ORBextractor.scaleFactor: 1.2
ORBextractor.nLevels: 8
ORBextractor.iniThFAST: 20
ORBextractor.minThFAST: 7

Viewer.KeyFrameSize: 0.05
";

    #[test]
    fn test_parse_orbslam_settings() {
        let settings = Settings::from_yaml_str(SETTINGS).unwrap();
        assert_eq!(settings.camera.width, 640);
        assert!((settings.camera.fx - 517.306408).abs() < 1e-9);
        assert_eq!(settings.orb.num_levels, 8);
        assert_eq!(settings.max_frames(), 30);
        assert_eq!(settings.tuning.tracking.min_inliers, 30);
    }

    #[test]
    fn test_tuning_overrides() {
        let text = format!(
            "{}\nTuning:\n  tracking:\n    min_inliers: 12\n  mapping:\n    mode: Inline\n",
            SETTINGS
        );
        let settings = Settings::from_yaml_str(&text).unwrap();
        assert_eq!(settings.tuning.tracking.min_inliers, 12);
        assert_eq!(settings.tuning.tracking.min_motion_matches, 20);
        assert_eq!(settings.tuning.mapping.mode, MaintenanceMode::Inline);
    }

    #[test]
    fn test_missing_intrinsics_rejected() {
        assert!(Settings::from_yaml_str("Camera.fx: 500.0\n").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let err = Settings::load("/nonexistent/settings.yaml").unwrap_err();
        assert!(err.is_init_error());
        assert!(err.to_string().contains("/nonexistent/settings.yaml"));
    }
}
