use std::time::Duration;
use thiserror::Error;

/// Error type shared by every component of the dispatch engine.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The broker could not be reached after every configured attempt.
    #[error("Could not connect to RabbitMQ after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: Box<WorkerError>,
    },

    /// The payload is not a UTF-8 JSON object.
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The handler did not finish within its execution budget.
    #[error("Message handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// A poison report could not be published.
    #[error("Failed to publish poison report: {0}")]
    Reporting(String),

    /// Settings could not be loaded.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError { message: String },
}

// Allow converting from a string-like type into a MessagingError
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::MessagingError { message: s }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::Decode(e.to_string())
    }
}

impl WorkerError {
    /// True for failures that mean the current broker session is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, WorkerError::Lapin(_) | WorkerError::Connection { .. })
    }
}
