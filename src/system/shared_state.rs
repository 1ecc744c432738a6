//! State shared between the tracking caller and the map maintainer thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::map::Map;

/// Shared state accessible by both the tracker and the maintainer.
pub struct SharedState {
    /// The map. Tracking reads; tracker commits and maintainer passes each
    /// take the write lock once.
    pub map: RwLock<Map>,

    /// Set while the maintainer is processing a keyframe. Keyframe creation
    /// is more eager when this is clear.
    maintainer_busy: AtomicBool,

    /// Request the maintainer to exit at its next checkpoint.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(map: Map) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(map),
            maintainer_busy: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn is_maintainer_idle(&self) -> bool {
        !self.maintainer_busy.load(Ordering::SeqCst)
    }

    pub fn set_maintainer_busy(&self, busy: bool) {
        self.maintainer_busy.store(busy, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
