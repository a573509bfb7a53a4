use std::sync::Arc;

use thiserror::Error;

/// Errors from connection, cache and lock operations.
///
/// A lock that could not be acquired and a cache miss are not errors; both
/// are reported as `Ok(None)` by the respective operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument { name: &'static str, message: String },

    #[error("invalid connection configuration: {0}")]
    Configuration(String),

    /// The shared connect attempt failed. Every caller waiting on that
    /// attempt receives a clone of the same underlying error.
    #[error("connection error: {0}")]
    Connect(Arc<redis::RedisError>),

    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection manager has been disposed")]
    Disposed,

    #[error("blocking call unavailable: {0}")]
    Runtime(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::InvalidArgument`].
    pub fn invalid_argument(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// Whether the error was raised while establishing the shared connection.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}
