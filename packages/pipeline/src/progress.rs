//! Progress reporting for the pipeline stages.
//!
//! [`ProgressCallback`] decouples stage reporting from any rendering
//! backend. The CLI supplies `indicatif` bars; tests and library callers
//! use [`NullProgress`].

/// Receives stage-level progress from [`crate::run_pipeline`].
pub trait ProgressCallback: Send + Sync {
    /// Set the number of stages that will run.
    fn set_total(&self, total: u64);

    /// Advance by `delta` completed stages.
    fn inc(&self, delta: u64);

    /// Name the stage currently running.
    fn set_message(&self, msg: String);

    /// Mark the run as complete with a final message.
    fn finish(&self, msg: String);
}

/// Ignores all progress updates.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}
