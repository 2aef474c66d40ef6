//! Error types for the CRNN system

use thiserror::Error;

/// Main error type for CRNN operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tensor or batch does not have the shape the model was built for
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A target sequence cannot be aligned or encoded
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Checkpoint persistence or restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Example loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Host-side array error
    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for CRNN operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create an invalid target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error signals a caller contract violation rather than an
    /// environmental failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ShapeMismatch(_) | Self::InvalidTarget(_))
    }
}
