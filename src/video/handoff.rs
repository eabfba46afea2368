//! Single-slot, latest-wins register between the renderer and the output callback

use crate::video::RenderedFrame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Latest-wins frame register
///
/// The renderer publishes whenever it finishes a frame; the output callback reads
/// whatever is newest. Publishing never blocks and never queues: an intermediate
/// frame that nobody read is simply replaced. Reading does not consume, so the
/// last frame keeps being shown until a newer one arrives.
#[derive(Default)]
pub struct FrameHandoff {
    slot: Mutex<Option<Arc<RenderedFrame>>>,
    published: AtomicU64,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame
    pub fn publish(&self, frame: Arc<RenderedFrame>) {
        let previous = {
            let mut slot = self.slot.lock();
            slot.replace(frame)
        };
        // the old frame may be the last reference; free it outside the lock
        drop(previous);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Current frame, if any has been published yet
    pub fn take_latest(&self) -> Option<Arc<RenderedFrame>> {
        self.slot.lock().clone()
    }

    /// Number of frames published so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
