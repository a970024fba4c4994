//! modelhost - local speech and chat models in isolated workers
//!
//! Runs speech-to-text, text-to-speech and chat models on the user's
//! machine, each inside its own worker context driven by a lifecycle
//! controller over a JSON message protocol.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
pub mod audio;
pub mod backend;
pub mod chat;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod controller;
pub mod defaults;
pub mod error;
pub mod models;
pub mod output;
pub mod preferences;
pub mod protocol;
pub mod registry;
pub mod serve;
pub mod task;
pub mod worker;

// Core types
pub use task::{ChatMessage, InferenceRequest, ModelLoadState, Role, Task, TaskResult};

// Backends (load → infer → reset)
pub use backend::{ModelBackend, ProgressSink, ScriptedBackend, TokenSink, UnavailableBackend};

// Orchestration
pub use app::Workbench;
pub use controller::{LifecycleController, LifecycleObserver};
pub use registry::{TaskRegistry, default_registry};

// Wire protocol
pub use protocol::{ControlMessage, WorkerEvent};

// Error handling
pub use error::{ModelhostError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }
}
