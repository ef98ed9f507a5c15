//! # RabbitMQ Dispatch
//! An at-least-once RabbitMQ consumer: bounded handler concurrency, one ack or
//! nack per delivery, requeue limits, and best-effort poison-message reporting.

pub mod ack;
pub mod broker;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod retry;
pub mod settings;
pub mod signal;
pub mod sink;

// Re-export key components for easy access
pub use ack::{AckAction, AckCoordinator};
pub use broker::{Acknowledger, Broker, BrokerConfig, BrokerConnection, ConnectionState, ReportPublisher, Session};
pub use consumer::{ConsumerLoop, LoopState, WorkerConfig};
pub use error::WorkerError;
pub use handler::{LoggingHandler, MessageHandler};
pub use message::{DecodedTask, DeliveryTag, DispatchOutcome, Message, Payload};
pub use pool::DispatchPool;
pub use retry::{Backoff, RetryConfig};
pub use settings::Settings;
pub use signal::shutdown_signal;
pub use sink::{PoisonMessageSink, PoisonReport, SinkStats};
