//! Common error types for ModelPool
//!
//! This module defines all error types used across the ModelPool system.
//! Every variant knows whether the caller may retry it.

use thiserror::Error;

/// Main error type for ModelPool
#[derive(Error, Debug)]
pub enum ModelPoolError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission failed even after eviction
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// No deployable model artifact for the user
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Worker did not announce readiness within the startup window
    #[error("Model load timed out: {0}")]
    ModelLoadTimeout(String),

    /// Worker failed to start or died while loading
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// Unknown chat session
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// In-flight request lost its worker to eviction or unload
    #[error("Worker evicted: {0}")]
    WorkerEvicted(String),

    /// Worker process exited while serving a request
    #[error("Worker exited: {0}")]
    WorkerExited(String),

    /// Worker reported a generation failure
    #[error("Worker error: {0}")]
    WorkerError(String),

    /// No output from the worker within the generation timeout
    #[error("Response timed out: {0}")]
    ResponseTimeout(String),

    /// Request abandoned by a session-level cancel
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModelPoolError {
    /// Whether retrying the same call later can succeed without outside help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelPoolError::InsufficientResources(_)
                | ModelPoolError::ModelLoadTimeout(_)
                | ModelPoolError::ModelLoadFailed(_)
                | ModelPoolError::WorkerEvicted(_)
                | ModelPoolError::WorkerExited(_)
                | ModelPoolError::WorkerError(_)
                | ModelPoolError::ResponseTimeout(_)
                | ModelPoolError::Io(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ModelPoolError::Config(msg.into())
    }

    /// Create an insufficient resources error
    pub fn insufficient_resources(msg: impl Into<String>) -> Self {
        ModelPoolError::InsufficientResources(msg.into())
    }

    /// Create a model not found error
    pub fn model_not_found(msg: impl Into<String>) -> Self {
        ModelPoolError::ModelNotFound(msg.into())
    }

    /// Create a model load failure
    pub fn model_load_failed(msg: impl Into<String>) -> Self {
        ModelPoolError::ModelLoadFailed(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(msg: impl Into<String>) -> Self {
        ModelPoolError::SessionNotFound(msg.into())
    }

    /// Create a worker evicted error
    pub fn worker_evicted(msg: impl Into<String>) -> Self {
        ModelPoolError::WorkerEvicted(msg.into())
    }

    /// Create a worker exited error
    pub fn worker_exited(msg: impl Into<String>) -> Self {
        ModelPoolError::WorkerExited(msg.into())
    }

    /// Create a response timeout error
    pub fn response_timeout(msg: impl Into<String>) -> Self {
        ModelPoolError::ResponseTimeout(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        ModelPoolError::Cancelled(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ModelPoolError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ModelPoolError::Internal(msg.into())
    }
}

impl From<config::ConfigError> for ModelPoolError {
    fn from(err: config::ConfigError) -> Self {
        ModelPoolError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for ModelPoolError {
    fn from(err: serde_yaml::Error) -> Self {
        ModelPoolError::Config(err.to_string())
    }
}

/// Result type alias for ModelPool operations
pub type Result<T> = std::result::Result<T, ModelPoolError>;
