use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run-wide control state shared by the reader, the analysers and the
/// writer: a cooperative stop flag and the first fatal error.
///
/// Every pipeline stage polls `stop_requested()` at its blocking points and
/// drains instead of aborting, so in-flight periods still reach the writer.
/// The error slot keeps only the first failure; later ones are reported by
/// their own threads but do not overwrite the root cause.
#[derive(Debug, Default)]
pub struct RunContext {
    stop: AtomicBool,
    error: Mutex<Option<String>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Request a cooperative stop without recording an error.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Record a fatal error and request a stop. The first error wins.
    pub fn fail(&self, error: impl Into<String>) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error.into());
        }
        self.stop.store(true, Ordering::Release);
    }

    /// The first recorded error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
