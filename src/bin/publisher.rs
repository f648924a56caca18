//! Publishes "Message N" to the shared exchange every `PUBLISH_INTERVAL_MS`.

use rabbitmq_relay::{app, AmqpPublishLink, Settings};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let shutdown = CancellationToken::new();
    app::stop_on_signal(shutdown.clone());

    let result = app::run_publisher(
        Settings::environment(),
        |settings| AmqpPublishLink::new(settings.broker_uri.clone(), settings.topology.clone()),
        shutdown,
    )
    .await;

    match result {
        Ok(_) => {
            log::info!("Application has shut down.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
