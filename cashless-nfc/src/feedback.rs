//! Haptic and acoustic feedback hooks fired at the end of a tap.

/// Device feedback. Implementations must not block.
pub trait Feedback: Send + Sync {
    fn success(&self);
    fn error(&self);
}

/// Does nothing; the default for headless terminals and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeedback;

impl Feedback for NoFeedback {
    fn success(&self) {}
    fn error(&self) {}
}

/// Emits a trace event in place of a buzz or beep.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFeedback;

impl Feedback for TracingFeedback {
    fn success(&self) {
        tracing::debug!(target: "cashless_nfc::feedback", "success");
    }

    fn error(&self) {
        tracing::debug!(target: "cashless_nfc::feedback", "error");
    }
}
