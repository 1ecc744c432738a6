//! Tracking state machine states.

/// State of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrackingState {
    /// No frame has been processed yet.
    #[default]
    NoImagesYet,
    /// Waiting for a frame pair that initializes the map.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Tracking failed; every new frame attempts relocalization.
    Lost,
}

impl TrackingState {
    /// Integer code used by the procedural API: 0, 1, 2, 3.
    pub fn code(self) -> i32 {
        match self {
            TrackingState::NoImagesYet => 0,
            TrackingState::NotInitialized => 1,
            TrackingState::Ok => 2,
            TrackingState::Lost => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TrackingState::NoImagesYet),
            1 => Some(TrackingState::NotInitialized),
            2 => Some(TrackingState::Ok),
            3 => Some(TrackingState::Lost),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackingState::NoImagesYet => "NO_IMAGES_YET",
            TrackingState::NotInitialized => "NOT_INITIALIZED",
            TrackingState::Ok => "OK",
            TrackingState::Lost => "LOST",
        };
        f.write_str(name)
    }
}
