//! Lifetime of the local audio feeding a session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Local capture or outgoing audio that ends when the session is left.
pub trait LocalMedia: Send + Sync {
    /// Stops producing audio. Calling it twice is harmless.
    fn stop(&self);
}

/// Stop switch shared with a capture callback that cannot leave its thread.
///
/// The session holds one clone and flips it on leave; the capture side
/// checks [`CaptureSwitch::is_stopped`] before forwarding each buffer.
#[derive(Clone, Default)]
pub struct CaptureSwitch {
    stopped: Arc<AtomicBool>,
}

impl CaptureSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl LocalMedia for CaptureSwitch {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl fmt::Debug for CaptureSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSwitch")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
