//! Error types for Ember Core.

use thiserror::Error;

/// Result type alias for Ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum EmberError {
    /// Invalid model configuration, detected at construction.
    #[error("invalid config: {0}")]
    Config(String),

    /// Tensor shapes do not line up with what a layer expects.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Checkpoint loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Tokenizer loading or encoding error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Generation request rejected before running the model.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Generation stopped by the caller's cancellation flag.
    #[error("generation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
