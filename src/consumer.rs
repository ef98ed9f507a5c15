//! The consumer loop and its configuration.

use crate::ack::AckCoordinator;
use crate::broker::{Acknowledger, Broker, ReportPublisher, Session};
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::message::{decode, DispatchOutcome, Message};
use crate::pool::{Completion, CompletionSender, DispatchPool};
use crate::retry::RetryConfig;
use crate::sink::{FailureKind, PoisonMessageSink, PoisonReport};
use futures_util::StreamExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Configuration for a `ConsumerLoop`.
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The name of the queue to consume messages from.
    pub request_queue: String,
    /// The queue poison reports are published to.
    pub report_queue: String,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// Upper bound on concurrently running handlers.
    pub max_concurrency: usize,
    /// The number of messages to fetch from the server at a time (QoS prefetch count).
    pub prefetch_count: u16,
    pub handler_timeout: Duration,
    /// How long shutdown waits for running handlers before abandoning them.
    pub shutdown_timeout: Duration,
    /// The configuration for message retry behavior.
    pub retry_config: RetryConfig,
    /// Poison reports buffered before new ones are dropped.
    pub report_capacity: usize,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    pub fn builder(request_queue: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(request_queue.into())
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    request_queue: String,
    report_queue: Option<String>,
    consumer_tag: Option<String>,
    max_concurrency: Option<usize>,
    prefetch_count: Option<u16>,
    handler_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    retry_config: Option<RetryConfig>,
    report_capacity: Option<usize>,
}

impl WorkerConfigBuilder {
    fn new(request_queue: String) -> Self {
        Self {
            request_queue,
            report_queue: None,
            consumer_tag: None,
            max_concurrency: None,
            prefetch_count: None,
            handler_timeout: None,
            shutdown_timeout: None,
            retry_config: None,
            report_capacity: None,
        }
    }

    /// Defaults to `{request_queue}_report` if not set.
    pub fn report_queue(mut self, report_queue: impl Into<String>) -> Self {
        self.report_queue = Some(report_queue.into());
        self
    }

    /// Defaults to `{request_queue}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Defaults to 8. Values below 1 are raised to 1.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Defaults to the pool size, so the broker never pushes more than the pool can run.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Defaults to 30 seconds.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Defaults to 10 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Defaults to `RetryConfig::default()`.
    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }

    /// Defaults to 256.
    pub fn report_capacity(mut self, capacity: usize) -> Self {
        self.report_capacity = Some(capacity);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let request_queue = self.request_queue;
        let max_concurrency = self.max_concurrency.unwrap_or(8).max(1);
        WorkerConfig {
            report_queue: self.report_queue.unwrap_or_else(|| format!("{}_report", request_queue)),
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", request_queue)),
            max_concurrency,
            prefetch_count: self
                .prefetch_count
                .unwrap_or_else(|| u16::try_from(max_concurrency).unwrap_or(u16::MAX)),
            handler_timeout: self.handler_timeout.unwrap_or(Duration::from_secs(30)),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(10)),
            retry_config: self.retry_config.unwrap_or_default(),
            report_capacity: self.report_capacity.unwrap_or(256),
            request_queue,
        }
    }
}

/// Lifecycle of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Connected,
    Consuming,
    Draining,
    Closed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Connected => "connected",
            LoopState::Consuming => "consuming",
            LoopState::Draining => "draining",
            LoopState::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Ends a session whose connection is gone. The broker redelivers whatever it left unsettled.
fn abandon<A: Acknowledger>(acks: &AckCoordinator<A>) -> SessionEnd {
    log::warn!(
        "Session lost with {} message(s) unsettled and {} failure history entries discarded",
        acks.pending(),
        acks.failing()
    );
    SessionEnd::Disconnected
}

enum Event {
    Shutdown,
    Completed(Completion),
    Delivery(Option<Result<Message, WorkerError>>),
}

/// Receives messages from the broker, dispatches them to the handler pool and
/// settles every delivery through an `AckCoordinator`.
pub struct ConsumerLoop<B: Broker, H: MessageHandler> {
    broker: B,
    pool: DispatchPool<H>,
    sink: PoisonMessageSink,
    config: WorkerConfig,
    state: LoopState,
}

impl<B: Broker, H: MessageHandler + 'static> ConsumerLoop<B, H> {
    /// Creates the loop and spawns its poison report task, so it must be
    /// called from within a tokio runtime.
    pub fn new(broker: B, handler: Arc<H>, config: WorkerConfig) -> Self {
        let pool = DispatchPool::new(handler, config.max_concurrency, config.handler_timeout);
        let sink = PoisonMessageSink::spawn(config.report_queue.clone(), config.report_capacity);
        Self {
            broker,
            pool,
            sink,
            config,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn sink(&self) -> &PoisonMessageSink {
        &self.sink
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Consumes until `shutdown` resolves, reconnecting whenever the session is lost.
    ///
    /// Returns `Ok(())` after a graceful drain. The only error is a connection
    /// that could not be (re)established within the broker's retry budget.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<(), WorkerError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let connected = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                result = self.broker.connect(&self.config) => Some(result),
            };

            let session = match connected {
                None => {
                    log::info!("Shutdown requested before a connection was established.");
                    self.broker.close().await;
                    self.transition(LoopState::Closed);
                    return Ok(());
                }
                Some(Err(e)) => {
                    log::error!("Giving up on RabbitMQ: {}", e);
                    self.transition(LoopState::Closed);
                    return Err(e);
                }
                Some(Ok(session)) => session,
            };
            self.transition(LoopState::Connected);

            match self.consume(session, shutdown.as_mut()).await {
                SessionEnd::Shutdown => {
                    self.sink.flush().await;
                    self.sink.detach().await;
                    self.broker.close().await;
                    self.transition(LoopState::Closed);
                    log::info!("Consumer for '{}' has shut down.", self.config.request_queue);
                    return Ok(());
                }
                SessionEnd::Disconnected => {
                    self.sink.detach().await;
                    self.broker.mark_disconnected();
                    self.transition(LoopState::Idle);
                    log::warn!("Lost connection to RabbitMQ, reconnecting...");
                }
            }
        }
    }

    async fn consume<A, P, S>(&mut self, session: Session<A, P>, mut shutdown: Pin<&mut S>) -> SessionEnd
    where
        A: Acknowledger + 'static,
        P: ReportPublisher + 'static,
        S: Future<Output = ()>,
    {
        let Session {
            acker,
            publisher,
            mut deliveries,
        } = session;
        self.sink.attach(Arc::new(publisher)).await;
        let mut acks = AckCoordinator::new(acker, self.config.retry_config, self.sink.clone());
        let (completions_tx, mut completions) = mpsc::unbounded_channel();

        self.transition(LoopState::Consuming);
        log::info!("Waiting for messages on '{}'...", self.config.request_queue);

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.as_mut() => Event::Shutdown,
                Some(done) = completions.recv() => Event::Completed(done),
                next = deliveries.next() => Event::Delivery(next),
            };

            let result = match event {
                Event::Shutdown => break,
                Event::Completed(done) => acks.resolve(done.delivery_tag, done.outcome).await.map(|_| ()),
                Event::Delivery(Some(Ok(message))) => self.dispatch(message, &mut acks, &completions_tx).await,
                Event::Delivery(Some(Err(e))) => {
                    log::error!("Delivery stream failed: {}", e);
                    return abandon(&acks);
                }
                Event::Delivery(None) => {
                    log::warn!("Delivery stream for '{}' ended", self.config.request_queue);
                    return abandon(&acks);
                }
            };

            if let Err(e) = result {
                if e.is_connection_loss() {
                    log::error!("Broker call failed, dropping session: {}", e);
                    return abandon(&acks);
                }
                log::error!("Message processing failed with a recoverable error: {}", e);
            }
        }

        self.transition(LoopState::Draining);
        self.broker.stop_consuming().await;
        drop(deliveries);
        self.drain(&mut acks, &mut completions).await;
        SessionEnd::Shutdown
    }

    async fn dispatch<A: Acknowledger>(
        &self,
        message: Message,
        acks: &mut AckCoordinator<A>,
        completions: &CompletionSender,
    ) -> Result<(), WorkerError> {
        let tag = message.delivery_tag;
        log::debug!(
            "Received message. Tag: {}, {} bytes, redelivered: {}",
            tag,
            message.payload.len(),
            message.redelivered
        );
        acks.track(&message);

        match decode(&message) {
            Ok(task) => {
                self.pool.submit(task, completions.clone()).await;
                Ok(())
            }
            Err(reason) => {
                log::error!("Failed to parse message, reporting it as poison. Tag: {}, Error: {}", tag, reason);
                self.sink.report(PoisonReport::new(
                    FailureKind::Decode,
                    &message.payload,
                    tag,
                    1,
                    reason.clone(),
                ));
                acks.resolve(tag, DispatchOutcome::DecodeError(reason)).await.map(|_| ())
            }
        }
    }

    /// Settles outcomes until the pool is idle or the shutdown timeout passes.
    async fn drain<A: Acknowledger>(
        &self,
        acks: &mut AckCoordinator<A>,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        log::info!(
            "Draining {} in-flight message(s), waiting up to {:?}...",
            self.pool.in_flight(),
            self.config.shutdown_timeout
        );

        loop {
            let next = tokio::select! {
                biased;
                done = completions.recv() => done,
                _ = self.pool.idle() => None,
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!(
                        "Shutdown timeout reached, abandoning {} message(s) for redelivery",
                        acks.pending()
                    );
                    return;
                }
            };

            match next {
                Some(done) => {
                    if let Err(e) = acks.resolve(done.delivery_tag, done.outcome).await {
                        log::error!("Failed to settle message during drain: {}", e);
                    }
                }
                None => break,
            }
        }

        // Workers send before releasing their slot, so everything is queued by now.
        while let Ok(done) = completions.try_recv() {
            if let Err(e) = acks.resolve(done.delivery_tag, done.outcome).await {
                log::error!("Failed to settle message during drain: {}", e);
            }
        }
        log::info!("Drain complete, {} message(s) left unacknowledged", acks.pending());
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            log::info!("Consumer loop {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
