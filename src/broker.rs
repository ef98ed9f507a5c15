//! Broker connectivity: the lapin connection, its channels, and the seams the
//! rest of the engine talks to.

use crate::consumer::WorkerConfig;
use crate::error::WorkerError;
use crate::message::{DeliveryTag, Message};
use crate::retry::{retry_with_backoff, Backoff};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::fmt;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Acknowledges deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError>;
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError>;
}

/// Publishes a body to a queue through the default exchange.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), WorkerError>;
}

#[async_trait]
impl Acknowledger for Channel {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError> {
        self.basic_nack(tag, BasicNackOptions { requeue, ..Default::default() })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReportPublisher for Channel {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), WorkerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        self.basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?;
        Ok(())
    }
}

/// Everything the consumer loop needs from one live connection.
pub struct Session<A, P> {
    /// Ack/nack handle for the consume channel. Only the consumer loop uses it.
    pub acker: A,
    /// Separate handle for poison reports, owned by the sink's task.
    pub publisher: P,
    /// Push-based delivery stream. An error or the end of the stream means the
    /// connection is gone.
    pub deliveries: BoxStream<'static, Result<Message, WorkerError>>,
}

/// A source of broker sessions.
#[async_trait]
pub trait Broker: Send {
    type Acker: Acknowledger + 'static;
    type Publisher: ReportPublisher + 'static;

    /// Opens a connection, declares the queues and starts consuming.
    ///
    /// Retries with backoff; an error means every attempt failed.
    async fn connect(
        &mut self,
        config: &WorkerConfig,
    ) -> Result<Session<Self::Acker, Self::Publisher>, WorkerError>;

    /// Cancels the consumer so no new deliveries arrive. Acks still work.
    async fn stop_consuming(&mut self);

    /// Records that the current session was lost and drops its handles.
    fn mark_disconnected(&mut self);

    /// Closes channels and connection. Errors are logged, not returned.
    async fn close(&mut self);

    fn state(&self) -> ConnectionState;
}

/// Connection parameters for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Connect to `host` with client defaults for everything else.
    pub debug: bool,
    pub backoff: Backoff,
    pub connect_attempts: u32,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        if self.debug {
            return uri;
        }
        uri.authority = AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: self.username.clone(),
                password: self.password.clone(),
            },
            host: self.host.clone(),
            port: self.port,
        };
        uri.vhost = self.vhost.clone();
        uri
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            debug: false,
            backoff: Backoff::default(),
            connect_attempts: 5,
        }
    }
}

/// The lapin-backed `Broker`.
pub struct BrokerConnection {
    config: BrokerConfig,
    state: ConnectionState,
    connection: Option<Connection>,
    consume_channel: Option<Channel>,
    report_channel: Option<Channel>,
    consumer_tag: Option<String>,
}

struct Opened {
    connection: Connection,
    consume_channel: Channel,
    report_channel: Channel,
    consumer: lapin::Consumer,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            connection: None,
            consume_channel: None,
            report_channel: None,
            consumer_tag: None,
        }
    }

    /// Idempotently ensures `name` exists as a durable queue.
    pub async fn declare_queue(&self, name: &str) -> Result<(), WorkerError> {
        let channel = self
            .consume_channel
            .as_ref()
            .ok_or_else(|| WorkerError::from("cannot declare a queue while disconnected"))?;
        declare_queue(channel, name).await
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("Broker connection {} -> {}", self.state, next);
            self.state = next;
        }
    }

    async fn open(uri: AMQPUri, config: &WorkerConfig) -> Result<Opened, WorkerError> {
        let connection = Connection::connect_uri(uri, ConnectionProperties::default()).await?;
        let consume_channel = connection.create_channel().await?;
        let report_channel = connection.create_channel().await?;

        declare_queue(&consume_channel, &config.request_queue).await?;
        declare_queue(&consume_channel, &config.report_queue).await?;

        consume_channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", config.prefetch_count);

        let consumer = consume_channel
            .basic_consume(
                &config.request_queue,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Opened {
            connection,
            consume_channel,
            report_channel,
            consumer,
        })
    }
}

async fn declare_queue(channel: &Channel, name: &str) -> Result<(), WorkerError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    log::debug!("Queue '{}' declared", name);
    Ok(())
}

#[async_trait]
impl Broker for BrokerConnection {
    type Acker = Channel;
    type Publisher = Channel;

    async fn connect(&mut self, config: &WorkerConfig) -> Result<Session<Channel, Channel>, WorkerError> {
        self.transition(ConnectionState::Connecting);
        let uri = self.config.uri();
        let (host, port) = (uri.authority.host.clone(), uri.authority.port);

        let opened = retry_with_backoff(&self.config.backoff, self.config.connect_attempts, |attempt| {
            log::info!(
                "Connecting to RabbitMQ at {}:{} (attempt {}/{})...",
                host,
                port,
                attempt,
                self.config.connect_attempts
            );
            Self::open(uri.clone(), config)
        })
        .await;

        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        log::info!(
            "Connection established with RabbitMQ. Consuming '{}' with tag '{}'.",
            config.request_queue,
            opened.consumer.tag().as_str()
        );

        let session = Session {
            acker: opened.consume_channel.clone(),
            publisher: opened.report_channel.clone(),
            deliveries: opened
                .consumer
                .map(|delivery| delivery.map(Message::from_delivery).map_err(WorkerError::from))
                .boxed(),
        };

        self.connection = Some(opened.connection);
        self.consume_channel = Some(opened.consume_channel);
        self.report_channel = Some(opened.report_channel);
        self.consumer_tag = Some(config.consumer_tag.clone());
        self.transition(ConnectionState::Connected);
        Ok(session)
    }

    async fn stop_consuming(&mut self) {
        if let (Some(channel), Some(tag)) = (&self.consume_channel, self.consumer_tag.take()) {
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                log::warn!("Failed to cancel consumer '{}': {}", tag, e);
            }
        }
    }

    fn mark_disconnected(&mut self) {
        self.consume_channel = None;
        self.report_channel = None;
        self.connection = None;
        self.consumer_tag = None;
        self.transition(ConnectionState::Disconnected);
    }

    async fn close(&mut self) {
        self.transition(ConnectionState::Closing);
        self.stop_consuming().await;

        for channel in [self.consume_channel.take(), self.report_channel.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = channel.close(200, "Normal shutdown").await {
                log::warn!("Failed to close channel {}: {}", channel.id(), e);
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "Normal shutdown").await {
                log::warn!("Failed to close connection: {}", e);
            }
        }
        self.transition(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
