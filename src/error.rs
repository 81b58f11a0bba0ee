//! Error types for the Floodgate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Malformed service configuration or rule set. Fatal at boot.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An identifier named a dimension no rule can key on
    #[error("Unknown identifier dimension: {0}")]
    UnknownDimension(String),

    /// The counter store could not be reached or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for FloodgateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => FloodgateError::StoreUnavailable(reason),
        }
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
