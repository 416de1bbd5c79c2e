//! Error Handling Module
//!
//! Defines the error taxonomy of the trainer.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for trainer operations
#[derive(Error, Debug)]
pub enum SslError {
    /// Bad or missing configuration value, raised before any object is built
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unreadable or corrupt checkpoint
    #[error("Checkpoint error at '{path}': {reason}")]
    Checkpoint { path: String, reason: String },

    /// A single step produced a non-finite loss
    #[error("Non-finite loss at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize },

    /// Too many consecutive non-finite steps
    #[error("Training diverged: {consecutive} consecutive non-finite losses (epoch {epoch}, step {step})")]
    Divergence {
        epoch: usize,
        step: usize,
        consecutive: usize,
    },

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error loading a frame
    #[error("Failed to load frame '{0}': {1}")]
    FrameLoad(PathBuf, String),

    /// Error with model operations
    #[error("Model error: {0}")]
    Model(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl SslError {
    /// Build a checkpoint error for a path-like source
    pub fn checkpoint(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        SslError::Checkpoint {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience Result type for trainer operations
pub type Result<T> = std::result::Result<T, SslError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Map the error into a model error with lazy context
    fn model_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    fn model_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| SslError::Model(format!("{}: {:?}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SslError::Dataset("empty list".to_string());
        assert_eq!(format!("{}", err), "Dataset error: empty list");
    }

    #[test]
    fn test_divergence_display() {
        let err = SslError::Divergence {
            epoch: 2,
            step: 17,
            consecutive: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3 consecutive"));
        assert!(msg.contains("epoch 2"));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::num::ParseIntError> = "x".parse::<i32>();
        let err = result.model_context(|| "reading logits".to_string()).unwrap_err();
        assert!(format!("{}", err).starts_with("Model error: reading logits"));
    }
}
