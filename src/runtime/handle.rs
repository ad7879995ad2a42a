use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cancellation handle for a scheduled callback.
///
/// Returned by [`LoopHandle::call_soon`](crate::runtime::LoopHandle::call_soon)
/// and friends. Cancelling marks the entry; the loop skips marked entries when
/// it drains the ready queue or pops timers, so a callback cancelled before
/// its fire time is never invoked.
///
/// The flag is atomic, so a handle obtained from a thread-safe scheduling call
/// may be cancelled from any thread.
#[derive(Clone)]
pub struct Handle {
    cancelled: Arc<AtomicBool>,
}

impl Handle {
    pub(crate) fn new() -> Handle {
        Handle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attempt to cancel the callback.
    ///
    /// Has no effect if the callback already ran.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether this handle has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
