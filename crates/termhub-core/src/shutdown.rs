//! Shared shutdown status.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Process-wide shutdown flag.
///
/// Starts out false, flips to true once on the first shutdown signal and is
/// never reset. Cloning shares the same flag, so one handle is created at
/// startup and handed to every component making best-effort outbound calls.
#[derive(Debug, Clone, Default)]
pub struct ShutdownState {
    flag: Arc<AtomicBool>,
}

impl ShutdownState {
    /// Create a new handle in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process as shutting down.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn begin(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
