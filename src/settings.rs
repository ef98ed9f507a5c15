//! Deployment settings read from `config/default.*` and the environment.

use crate::broker::BrokerConfig;
use crate::consumer::WorkerConfig;
use crate::retry::{Backoff, RetryConfig};
use crate::error::WorkerError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Flat settings, one field per environment variable (`RABBITMQ_HOST` -> `rabbitmq_host`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub rabbitmq_host: String,
    pub rabbitmq_port: u16,
    pub rabbitmq_vhost: String,
    pub rabbitmq_username: String,
    pub rabbitmq_password: String,
    /// Connect to the host with client defaults, ignoring port, vhost and credentials.
    pub debug: bool,
    pub request_queue: String,
    pub response_queue: String,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub connect_attempts: u32,
    pub handler_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub failure_ttl_secs: u64,
}

/// Settings as found in the sources; anything missing falls back to `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
struct PartialSettings {
    rabbitmq_host: Option<String>,
    rabbitmq_port: Option<u16>,
    rabbitmq_vhost: Option<String>,
    rabbitmq_username: Option<String>,
    rabbitmq_password: Option<String>,
    debug: Option<bool>,
    request_queue: Option<String>,
    response_queue: Option<String>,
    max_concurrency: Option<usize>,
    max_retries: Option<u32>,
    connect_attempts: Option<u32>,
    handler_timeout_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
    failure_ttl_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rabbitmq_host: "localhost".to_string(),
            rabbitmq_port: 5672,
            rabbitmq_vhost: "/".to_string(),
            rabbitmq_username: "guest".to_string(),
            rabbitmq_password: "guest".to_string(),
            debug: false,
            request_queue: "request".to_string(),
            response_queue: "response".to_string(),
            max_concurrency: 8,
            max_retries: 3,
            connect_attempts: 5,
            handler_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            failure_ttl_secs: 30 * 60,
        }
    }
}

impl Settings {
    /// Loads the optional `config/default` file, then overlays environment variables.
    pub fn load() -> Result<Self, WorkerError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            // Values stay strings; numeric fields convert on deserialize, so
            // credentials like `0123` keep their leading zero.
            .add_source(Environment::default())
            .build()?;

        let partial: PartialSettings = config.try_deserialize()?;
        let default = Settings::default();

        Ok(Settings {
            rabbitmq_host: partial.rabbitmq_host.unwrap_or(default.rabbitmq_host),
            rabbitmq_port: partial.rabbitmq_port.unwrap_or(default.rabbitmq_port),
            rabbitmq_vhost: partial.rabbitmq_vhost.unwrap_or(default.rabbitmq_vhost),
            rabbitmq_username: partial.rabbitmq_username.unwrap_or(default.rabbitmq_username),
            rabbitmq_password: partial.rabbitmq_password.unwrap_or(default.rabbitmq_password),
            debug: partial.debug.unwrap_or(default.debug),
            request_queue: partial.request_queue.unwrap_or(default.request_queue),
            response_queue: partial.response_queue.unwrap_or(default.response_queue),
            max_concurrency: partial.max_concurrency.unwrap_or(default.max_concurrency),
            max_retries: partial.max_retries.unwrap_or(default.max_retries),
            connect_attempts: partial.connect_attempts.unwrap_or(default.connect_attempts),
            handler_timeout_secs: partial.handler_timeout_secs.unwrap_or(default.handler_timeout_secs),
            shutdown_timeout_secs: partial.shutdown_timeout_secs.unwrap_or(default.shutdown_timeout_secs),
            failure_ttl_secs: partial.failure_ttl_secs.unwrap_or(default.failure_ttl_secs),
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.rabbitmq_host.clone(),
            port: self.rabbitmq_port,
            vhost: self.rabbitmq_vhost.clone(),
            username: self.rabbitmq_username.clone(),
            password: self.rabbitmq_password.clone(),
            debug: self.debug,
            backoff: Backoff::default(),
            connect_attempts: self.connect_attempts,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::builder(self.request_queue.clone())
            .report_queue(self.response_queue.clone())
            .max_concurrency(self.max_concurrency)
            .retry_config(
                RetryConfig::new(self.max_retries)
                    .with_failure_ttl(Duration::from_secs(self.failure_ttl_secs)),
            )
            .handler_timeout(Duration::from_secs(self.handler_timeout_secs))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .build()
    }
}
