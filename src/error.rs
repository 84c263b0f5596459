//! Error types for the telemetry pipeline

use thiserror::Error;

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Main error type for the telemetry pipeline
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Multivariate model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),
}

impl From<polars::error::PolarsError> for TelemetryError {
    fn from(err: polars::error::PolarsError) -> Self {
        TelemetryError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for TelemetryError {
    fn from(err: ndarray::ShapeError) -> Self {
        TelemetryError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
