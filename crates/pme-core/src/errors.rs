//! Error types for the PME pipeline.
//!
//! Recoverable failures (configuration, device faults reported by the stream)
//! travel as `PmeError`. Caller-contract violations are asserted instead and
//! never show up here.

use thiserror::Error;

/// Unified error type for PME configuration and device operations.
#[derive(Error, Debug)]
pub enum PmeError {
    /// Device-side failures (kernel execution, transfers)
    #[error("GPU error in {context}: {message}")]
    GpuError { context: String, message: String },

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input validation errors (atom counts, buffer sizes)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A stream entered the sticky error state
    #[error("Stream '{stream}' failed: {message}")]
    StreamError { stream: String, message: String },

    /// I/O errors (config file reading)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PmeError {
    /// Creates a GPU error with context.
    pub fn gpu(context: impl Into<String>, message: impl Into<String>) -> Self {
        PmeError::GpuError {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        PmeError::ConfigError(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        PmeError::ValidationError(message.into())
    }

    /// Creates a stream error.
    pub fn stream(stream: impl Into<String>, message: impl Into<String>) -> Self {
        PmeError::StreamError {
            stream: stream.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for PME operations.
pub type Result<T> = std::result::Result<T, PmeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let gpu_err = PmeError::gpu("solve", "grid buffer poisoned");
        assert!(matches!(gpu_err, PmeError::GpuError { .. }));

        let config_err = PmeError::config("pme_order out of range");
        assert!(matches!(config_err, PmeError::ConfigError(_)));

        let stream_err = PmeError::stream("pme", "kernel failed");
        assert_eq!(stream_err.to_string(), "Stream 'pme' failed: kernel failed");
    }

    #[test]
    fn test_validation_message() {
        let err = PmeError::validation("expected 4 atoms, got 3");
        assert_eq!(err.to_string(), "Validation error: expected 4 atoms, got 3");
    }
}
