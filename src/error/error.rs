//! Error types and handling for Permgate

use thiserror::Error;

/// Result type alias for Permgate operations
pub type Result<T> = std::result::Result<T, PermissionError>;

/// Main error type for Permgate
#[derive(Error, Debug)]
pub enum PermissionError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Rejected input at the codec boundary (unknown resource type, permission, ...)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Backend call failed for a whole batch
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Provider lifecycle misuse (double init, no runtime, ...)
    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PermissionError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle<S: Into<String>>(message: S) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PermissionError::Config { .. } => "config",
            PermissionError::Validation { .. } => "validation",
            PermissionError::Transport { .. } => "transport",
            PermissionError::Lifecycle { .. } => "lifecycle",
            PermissionError::Io(_) => "io",
            PermissionError::Http(_) => "http",
        }
    }
}
