//! Single-slot, latest-wins frame holder between capture and the output timer

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::Frame;

/// Most recently delivered frame.
///
/// `store` and `peek` are a single atomic pointer swap or load, so the
/// capture thread never waits on the timer and readers never see a torn frame.
#[derive(Clone, Default)]
pub struct FrameCache {
    slot: Arc<ArcSwapOption<Frame>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached frame unconditionally
    pub fn store(&self, frame: Arc<Frame>) {
        self.slot.store(Some(frame));
    }

    /// Current frame, or `None` if no frame has ever arrived
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }
}
