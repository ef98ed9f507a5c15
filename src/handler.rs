//! Defines the core trait for message handling logic.

use crate::error::WorkerError;
use crate::message::Payload;
use async_trait::async_trait;

/// A trait for processing decoded messages from the request queue.
///
/// Implement this trait for your business logic. The dispatch pool may call it
/// concurrently from several tasks, so implementations must be thread-safe.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes the top-level JSON object of a single message.
    ///
    /// # Returns
    /// `Ok(())` if the message was processed successfully, or a `WorkerError` if not.
    /// Errors (and panics) are turned into requeues until the retry budget runs out.
    async fn handle_message(&self, payload: Payload) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Handler used by the binary: logs every payload it receives.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle_message(&self, payload: Payload) -> Result<(), WorkerError> {
        log::info!("Received payload: {}", serde_json::Value::Object(payload));
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "LoggingHandler"
    }
}
