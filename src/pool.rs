//! Bounded worker pool running handler invocations off the receive loop.

use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::message::{DecodedTask, DeliveryTag, DispatchOutcome};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// The result of one handler invocation, tagged for the ack coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub delivery_tag: DeliveryTag,
    pub outcome: DispatchOutcome,
}

/// Where a worker sends its `Completion`.
///
/// Each broker session gets its own channel; once the receiving side is dropped
/// any late completion is discarded.
pub type CompletionSender = mpsc::UnboundedSender<Completion>;

/// Runs handler calls on at most `max_concurrency` tokio tasks at once.
pub struct DispatchPool<H: MessageHandler> {
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    handler_timeout: Duration,
}

impl<H: MessageHandler + 'static> DispatchPool<H> {
    pub fn new(handler: Arc<H>, max_concurrency: usize, handler_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            handler_timeout,
        }
    }

    /// Waits for a free worker slot, then starts the handler on it.
    ///
    /// Returns as soon as the slot is claimed. The outcome is sent to
    /// `completions` exactly once, whether the handler succeeds, fails,
    /// panics or times out.
    pub async fn submit(&self, task: DecodedTask, completions: CompletionSender) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the pool is alive.
            Err(_) => return,
        };
        let handler = self.handler.clone();
        let timeout = self.handler_timeout;

        tokio::spawn(async move {
            let delivery_tag = task.delivery_tag;
            let outcome = invoke(handler.as_ref(), task, timeout).await;
            if let DispatchOutcome::HandlerError(reason) = &outcome {
                log::error!(
                    "Handler '{}' failed. Tag: {}, Error: {}",
                    handler.handler_name(),
                    delivery_tag,
                    reason
                );
            }
            if completions.send(Completion { delivery_tag, outcome }).is_err() {
                log::debug!("Dropping outcome for tag {} from an abandoned session", delivery_tag);
            }
            drop(permit);
        });
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.permits.available_permits()
    }

    /// Resolves once no handler is running.
    pub async fn idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.max_concurrency as u32).await {
            drop(all);
        }
    }
}

async fn invoke<H: MessageHandler + ?Sized>(
    handler: &H,
    task: DecodedTask,
    timeout: Duration,
) -> DispatchOutcome {
    let call = AssertUnwindSafe(handler.handle_message(task.payload)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => DispatchOutcome::Success,
        Ok(Ok(Err(e))) => DispatchOutcome::HandlerError(e.to_string()),
        Ok(Err(panic)) => DispatchOutcome::HandlerError(format!("handler panicked: {}", panic_message(&*panic))),
        Err(_) => DispatchOutcome::HandlerError(WorkerError::HandlerTimeout(timeout).to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
