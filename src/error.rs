//! Error types surfaced by the engine.
//!
//! Tracking degradation is never an error: it shows up as
//! [`TrackingState::Lost`](crate::tracking::TrackingState::Lost). Only
//! construction failures and structural misuse produce a `SlamError`.

use std::path::PathBuf;

use thiserror::Error;

use crate::vocabulary::VocabularyError;

/// Errors returned by the public engine API.
#[derive(Debug, Error)]
pub enum SlamError {
    /// The ORB vocabulary could not be loaded.
    #[error("failed to load vocabulary from {path}: {source}")]
    Vocabulary {
        path: PathBuf,
        #[source]
        source: VocabularyError,
    },

    /// The settings file is missing or malformed.
    #[error("invalid settings file {path}: {reason}")]
    Settings { path: PathBuf, reason: String },

    /// An index accessor was called outside `[0, len)`.
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },

    /// The engine has been shut down and no longer accepts frames.
    #[error("engine has been shut down")]
    ShutDown,

    /// `track` was called with a timestamp older than the previous one, or
    /// with a non-finite timestamp.
    #[error("timestamp {current} precedes previous frame at {previous}")]
    NonMonotonicTimestamp { previous: f64, current: f64 },

    /// The feature extractor failed on the given image.
    #[error("feature extraction failed: {0}")]
    Extraction(#[from] anyhow::Error),
}

impl SlamError {
    /// True for errors that prevent an engine from being constructed.
    pub fn is_init_error(&self) -> bool {
        matches!(self, SlamError::Vocabulary { .. } | SlamError::Settings { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SlamError>;

/// Bounds-checked slice access producing [`SlamError::OutOfRange`].
pub(crate) fn checked_index<T>(items: &[T], index: usize) -> Result<&T> {
    items.get(index).ok_or(SlamError::OutOfRange {
        index,
        len: items.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = SlamError::OutOfRange { index: 3, len: 3 };
        assert_eq!(err.to_string(), "index 3 out of range (len 3)");
        assert!(!err.is_init_error());
    }

    #[test]
    fn test_init_errors() {
        let err = SlamError::Settings {
            path: PathBuf::from("settings.yaml"),
            reason: "missing Camera.fx".into(),
        };
        assert!(err.is_init_error());
        assert!(!SlamError::ShutDown.is_init_error());
    }

    #[test]
    fn test_checked_index() {
        let items = [1, 2, 3];
        assert_eq!(*checked_index(&items, 2).unwrap(), 3);
        assert!(matches!(
            checked_index(&items, 3),
            Err(SlamError::OutOfRange { index: 3, len: 3 })
        ));
    }
}
