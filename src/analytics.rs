//! Error reporting seam.
//!
//! Failures that are swallowed at runtime (a capture start refused by the
//! platform, for instance) are still reported somewhere. The host app plugs
//! in its own analytics through [`ErrorSink`]; the binary logs them.

use parking_lot::Mutex;

// ── Reports ─────────────────────────────────────────────────────

/// A single swallowed failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Where the failure happened (e.g. "capture.start").
    pub context: String,
    /// Display form of the error.
    pub message: String,
}

pub trait ErrorSink: Send + Sync {
    fn track_error(&self, context: &str, error: &dyn std::error::Error);
}

// ── Sinks ───────────────────────────────────────────────────────

/// Logs every report at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn track_error(&self, context: &str, error: &dyn std::error::Error) {
        tracing::error!(context, error = %error, "Tracked error");
    }
}

/// Keeps reports in memory, newest last.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn track_error(&self, context: &str, error: &dyn std::error::Error) {
        tracing::debug!(context, error = %error, "Recording error report");
        self.reports.lock().push(ErrorReport {
            context: context.to_string(),
            message: error.to_string(),
        });
    }
}
