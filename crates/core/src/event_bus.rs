//! Error-tracking collaborator: where swallowed failures get reported.
//!
//! Components that convert a failure into a state change (a provider send
//! that becomes a `failed` delivery record) still notify an
//! `Arc<dyn ErrorTracker>` so the failure is visible to operators.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::error;

/// Receives failures that were handled locally and must not propagate.
pub trait ErrorTracker: Send + Sync {
    fn notify(&self, error: &anyhow::Error, context: &str);
}

/// Default tracker: a structured `error!` log line.
pub struct LogErrorTracker;

impl ErrorTracker for LogErrorTracker {
    fn notify(&self, err: &anyhow::Error, context: &str) {
        error!(context = %context, error = %err, "Tracked error");
    }
}

/// In-memory tracker that captures notifications for testing.
#[derive(Default)]
pub struct CaptureTracker {
    errors: Mutex<Vec<(String, String)>>,
}

impl CaptureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured `(context, message)` pairs in notification order.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl ErrorTracker for CaptureTracker {
    fn notify(&self, err: &anyhow::Error, context: &str) {
        self.errors
            .lock()
            .push((context.to_string(), err.to_string()));
    }
}

/// Convenience: the logging tracker behind an `Arc`.
pub fn log_tracker() -> Arc<dyn ErrorTracker> {
    Arc::new(LogErrorTracker)
}

/// Convenience: create a capture tracker for tests.
pub fn capture_tracker() -> Arc<CaptureTracker> {
    Arc::new(CaptureTracker::new())
}
