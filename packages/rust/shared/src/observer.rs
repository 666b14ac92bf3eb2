//! Progress and warning sink handed to every long-running stage.

/// Receives stage transitions, progress ticks, and data-integrity warnings.
///
/// Passed explicitly into stages instead of relying on global logging state.
/// Every call is also mirrored to `tracing` by the stage itself.
pub trait PipelineObserver: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called for countable progress (jobs finished, files processed, epochs run).
    fn progress(&self, current: usize, total: usize, detail: &str);
    /// Called for recoverable data-integrity problems.
    fn warning(&self, message: &str);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn phase(&self, _name: &str) {}
    fn progress(&self, _current: usize, _total: usize, _detail: &str) {}
    fn warning(&self, _message: &str) {}
}
