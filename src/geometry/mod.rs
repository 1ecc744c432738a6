//! Geometry utilities: SE3 transforms, two-view models, PnP, triangulation.

pub mod epipolar;
pub mod pnp;
pub mod se3;
pub mod so3;
pub mod triangulation;

pub use pnp::{PnPResult, PnpRansacParams, solve_pnp_ransac};
pub use se3::SE3;
pub use triangulation::{projection_matrix, triangulate, triangulate_dlt};
