//! Error types for Sandrun

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Sandrun's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sandrun
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task queue error (filesystem layout, payload encoding)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Result storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Sandbox execution error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input rejected at admission
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No registered backend handles the language
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Backends exist for the language but none reports available right now
    #[error("No runtime available for '{0}'")]
    NoRuntimeAvailable(String),

    /// Session id is not in the session table
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// Session is closing or closed
    #[error("Session is closed: {0}")]
    SessionClosed(Uuid),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation abandoned because of shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Container(_)
                | Error::Sandbox(_)
                | Error::Storage(_)
                | Error::Timeout(_)
                | Error::NoRuntimeAvailable(_)
        )
    }

    /// Check if error is a client error (caller's fault, never retried)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::UnsupportedLanguage(_)
                | Error::SessionNotFound(_)
                | Error::SessionClosed(_)
                | Error::NotFound(_)
        )
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NoRuntimeAvailable("python".into()).is_retryable());
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(!Error::SessionClosed(Uuid::new_v4()).is_retryable());

        assert!(Error::SessionNotFound(Uuid::new_v4()).is_client_error());
        assert!(Error::UnsupportedLanguage("cobol".into()).is_client_error());
        assert!(!Error::Cancelled.is_client_error());
    }
}
