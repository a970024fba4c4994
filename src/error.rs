//! Error types for modelhost.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelhostError {
    // Request errors (rejected before anything reaches a worker)
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Unsupported audio format: {message}")]
    UnsupportedFormat { message: String },

    #[error("A request is already in flight for {task}")]
    Busy { task: String },

    // Backend errors
    #[error("Model load failed: {message}")]
    Load { message: String },

    #[error("Inference failed: {message}")]
    Inference { message: String },

    #[error("Generation interrupted")]
    Interrupted,

    #[error("Model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Model download failed: {message}")]
    Download { message: String },

    // Worker protocol errors
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Worker context closed")]
    ContextClosed,

    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ModelhostError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for an inference failure.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Shorthand for a load failure.
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelhostError>;
