use rabbitmq_dispatch::{shutdown_signal, BrokerConnection, ConsumerLoop, LoggingHandler, Settings};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if settings.debug {
        log::info!("Debug mode: connecting to {} with default credentials", settings.rabbitmq_host);
    }

    let broker = BrokerConnection::new(settings.broker_config());
    let mut consumer = ConsumerLoop::new(broker, Arc::new(LoggingHandler), settings.worker_config());

    match consumer.run(shutdown_signal()).await {
        Ok(()) => {
            log::info!("Application has shut down.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Consumer stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
