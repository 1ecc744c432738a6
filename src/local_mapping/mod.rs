//! Map growth and upkeep.
//!
//! - Triangulating new feature points when the tracker inserts a keyframe
//! - The map maintainer: recent-point culling, point refinement and map
//!   culling, run on its own thread or inline

pub mod map_maintainer;
pub mod triangulation;

pub use map_maintainer::{MaintenanceReport, MapMaintainer};
pub use triangulation::{scene_median_depth, triangulate_new_points, TriangulationReport};
