//! Best-effort reporting of poison messages to the report queue.

use crate::broker::ReportPublisher;
use crate::error::WorkerError;
use crate::message::DeliveryTag;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Why a message was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Decode,
    Handler,
}

/// The JSON document published to the report queue.
#[derive(Debug, Clone, Serialize)]
pub struct PoisonReport {
    pub reason: String,
    pub kind: FailureKind,
    pub original_message: String,
    pub delivery_tag: DeliveryTag,
    pub attempts: u32,
    /// When the first failed delivery was seen; only set for handler failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<DateTime<Utc>>,
    pub reported_at: DateTime<Utc>,
}

impl PoisonReport {
    pub fn new(
        kind: FailureKind,
        original_message: &[u8],
        delivery_tag: DeliveryTag,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            kind,
            original_message: String::from_utf8_lossy(original_message).into_owned(),
            delivery_tag,
            attempts,
            first_failed_at: None,
            reported_at: Utc::now(),
        }
    }

    pub fn first_failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_failed_at = Some(at);
        self
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Reports queued for publishing.
    pub accepted: u64,
    pub published: u64,
    /// Reports that reached the publisher (or had none) and failed.
    pub failed: u64,
    /// Reports rejected because the queue was full or closed.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

enum SinkCommand {
    Report(PoisonReport),
    Attach(Arc<dyn ReportPublisher>),
    Detach,
    Flush(oneshot::Sender<()>),
}

/// Handle to the background task that publishes poison reports.
///
/// Cloning is cheap; the task stops when the last handle is dropped.
#[derive(Clone)]
pub struct PoisonMessageSink {
    tx: mpsc::Sender<SinkCommand>,
    counters: Arc<Counters>,
}

impl PoisonMessageSink {
    /// Spawns the publishing task. Must be called from within a tokio runtime.
    pub fn spawn(report_queue: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        tokio::spawn(run(rx, report_queue.into(), counters.clone()));
        Self { tx, counters }
    }

    /// Queues a report without waiting. Never fails the caller.
    pub fn report(&self, report: PoisonReport) {
        log::error!(
            "Poison message (tag {}, {:?} failure after {} attempt(s)): {}",
            report.delivery_tag,
            report.kind,
            report.attempts,
            report.reason
        );
        match self.tx.try_send(SinkCommand::Report(report)) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Poison report queue is full, report dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Poison report task has stopped, report dropped");
            }
        }
    }

    /// Routes subsequent reports through `publisher`.
    pub async fn attach(&self, publisher: Arc<dyn ReportPublisher>) {
        let _ = self.tx.send(SinkCommand::Attach(publisher)).await;
    }

    /// Stops publishing until the next `attach`.
    pub async fn detach(&self) {
        let _ = self.tx.send(SinkCommand::Detach).await;
    }

    /// Waits until every report queued so far has been handled.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run(mut rx: mpsc::Receiver<SinkCommand>, queue: String, counters: Arc<Counters>) {
    let mut publisher: Option<Arc<dyn ReportPublisher>> = None;
    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Report(report) => {
                match publish(publisher.as_deref(), &queue, &report).await {
                    Ok(()) => {
                        counters.published.fetch_add(1, Ordering::Relaxed);
                        log::info!("Poison report for tag {} published to '{}'", report.delivery_tag, queue);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        log::warn!("{}", e);
                    }
                }
            }
            SinkCommand::Attach(next) => publisher = Some(next),
            SinkCommand::Detach => publisher = None,
            SinkCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Poison report task stopped");
}

async fn publish(
    publisher: Option<&dyn ReportPublisher>,
    queue: &str,
    report: &PoisonReport,
) -> Result<(), WorkerError> {
    let publisher = publisher.ok_or_else(|| {
        WorkerError::Reporting(format!("no broker channel for report of tag {}", report.delivery_tag))
    })?;
    let body = serde_json::to_vec(report).map_err(|e| WorkerError::Reporting(e.to_string()))?;
    publisher
        .publish(queue, &body)
        .await
        .map_err(|e| WorkerError::Reporting(e.to_string()))
}
