//! Turns dispatch outcomes into exactly one ack or nack per delivery.

use crate::broker::Acknowledger;
use crate::error::WorkerError;
use crate::message::{DeliveryTag, DispatchOutcome, Message};
use crate::retry::{MessageRetryInfo, RetryConfig, RetryKey};
use crate::sink::{FailureKind, PoisonMessageSink, PoisonReport};
use chrono::Utc;
use std::collections::HashMap;

/// What the coordinator told the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Acked,
    /// Nacked with requeue; `attempt` failed deliveries so far.
    Requeued { attempt: u32 },
    /// Nacked without requeue because the payload could not be decoded.
    Rejected,
    /// Nacked without requeue after the retry budget ran out, and reported.
    Poisoned { attempts: u32 },
}

struct PendingDelivery {
    retry_key: RetryKey,
    payload: Vec<u8>,
}

/// Single owner of the consume channel's ack/nack calls for one session.
///
/// Every tracked tag is resolved at most once; resolving an unknown or already
/// resolved tag is a no-op. A fresh coordinator is built on every reconnect, so
/// retry counts do not survive a lost connection.
pub struct AckCoordinator<A: Acknowledger> {
    acker: A,
    retry: RetryConfig,
    sink: PoisonMessageSink,
    pending: HashMap<DeliveryTag, PendingDelivery>,
    failures: HashMap<RetryKey, MessageRetryInfo>,
}

impl<A: Acknowledger> AckCoordinator<A> {
    pub fn new(acker: A, retry: RetryConfig, sink: PoisonMessageSink) -> Self {
        Self {
            acker,
            retry,
            sink,
            pending: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Takes ownership of the message's tag until it is resolved.
    pub fn track(&mut self, message: &Message) {
        self.pending.insert(
            message.delivery_tag,
            PendingDelivery {
                retry_key: RetryKey::for_message(message),
                payload: message.payload.clone(),
            },
        );
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of messages with a failure history in this session.
    pub fn failing(&self) -> usize {
        self.failures.len()
    }

    fn forget_stale_failures(&mut self) {
        let now = Utc::now();
        let ttl = self.retry.failure_ttl;
        self.failures.retain(|key, info| {
            let stale = info.is_stale(now, ttl);
            if stale {
                log::debug!("Forgetting {} failure(s) of {:?}: no redelivery seen", info.retry_count, key);
            }
            !stale
        });
    }

    /// Acks or nacks `tag` according to `outcome`.
    ///
    /// Returns `Ok(None)` when the tag was not pending. An error means the
    /// broker call failed; the tag is no longer tracked and the broker will
    /// redeliver the message once the channel is gone.
    pub async fn resolve(
        &mut self,
        tag: DeliveryTag,
        outcome: DispatchOutcome,
    ) -> Result<Option<AckAction>, WorkerError> {
        let Some(delivery) = self.pending.remove(&tag) else {
            log::debug!("Ignoring outcome {:?} for unknown or resolved tag {}", outcome, tag);
            return Ok(None);
        };

        match outcome {
            DispatchOutcome::Success => {
                self.failures.remove(&delivery.retry_key);
                self.acker.ack(tag).await?;
                log::info!("Message processed successfully. Tag: {}", tag);
                Ok(Some(AckAction::Acked))
            }
            DispatchOutcome::DecodeError(reason) => {
                self.acker.nack(tag, false).await?;
                log::error!("Message rejected without requeue. Tag: {}, Error: {}", tag, reason);
                Ok(Some(AckAction::Rejected))
            }
            DispatchOutcome::HandlerError(reason) => {
                self.forget_stale_failures();
                let info = self.failures.entry(delivery.retry_key.clone()).or_default();
                info.increment_retry();
                let attempt = info.retry_count;
                let first_failed_at = info.first_failure_time;

                if self.retry.should_retry(attempt) {
                    self.acker.nack(tag, true).await?;
                    log::warn!(
                        "Message requeued after failure {}/{}. Tag: {}, Error: {}",
                        attempt,
                        self.retry.max_retries + 1,
                        tag,
                        reason
                    );
                    return Ok(Some(AckAction::Requeued { attempt }));
                }

                self.failures.remove(&delivery.retry_key);
                self.acker.nack(tag, false).await?;
                self.sink.report(
                    PoisonReport::new(FailureKind::Handler, &delivery.payload, tag, attempt, reason)
                        .first_failed_at(first_failed_at),
                );
                Ok(Some(AckAction::Poisoned { attempts: attempt }))
            }
        }
    }
}
