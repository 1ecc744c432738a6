//! Dataset input and trajectory output for the command-line runner.

pub mod euroc;

pub use euroc::{write_tum_trajectory, EurocSequence, ImageEntry};
