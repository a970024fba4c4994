//! Callbacks through which a controller reports to its UI collaborator.

use crate::task::{ModelLoadState, Task, TaskResult};
use tracing::{debug, info, warn};

/// Receives controller side effects.
///
/// Called from the controller's event pump; implementations must not block.
pub trait LifecycleObserver: Send + Sync {
    /// The load state changed variant.
    fn on_state_change(&self, _task: Task, _state: &ModelLoadState) {}

    /// A load phase or fraction was reported.
    fn on_progress(&self, _task: Task, _fraction: f32, _message: &str) {}

    /// Streamed output arrived.
    fn on_update(&self, _task: Task, _output: &str, _tps: Option<f64>) {}

    /// A request completed.
    fn on_complete(&self, _task: Task, _result: &TaskResult) {}

    /// A load or request failed.
    fn on_error(&self, _task: Task, _error: &str) {}
}

/// Observer that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl LifecycleObserver for LogObserver {
    fn on_state_change(&self, task: Task, state: &ModelLoadState) {
        info!(%task, state = %state.label(), "model state changed");
    }

    fn on_progress(&self, task: Task, fraction: f32, message: &str) {
        debug!(%task, fraction, message, "load progress");
    }

    fn on_complete(&self, task: Task, _result: &TaskResult) {
        debug!(%task, "request complete");
    }

    fn on_error(&self, task: Task, error: &str) {
        warn!(%task, error, "request failed");
    }
}
