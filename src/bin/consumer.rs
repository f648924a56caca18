//! Prints every message from the shared queue, one line each, acknowledging
//! it only once printed.

use rabbitmq_relay::{app, AmqpConsumeLink, Deduplicate, PrintHandler, Settings};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Deliveries remembered for skipping redelivered duplicates.
const DEDUP_WINDOW: usize = 10_000;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let shutdown = CancellationToken::new();
    app::stop_on_signal(shutdown.clone());

    let result = app::run_consumer(
        Settings::environment(),
        |settings| {
            AmqpConsumeLink::new(
                settings.broker_uri.clone(),
                settings.topology.clone(),
                settings.prefetch_count,
            )
        },
        Deduplicate::new(PrintHandler::stdout(), DEDUP_WINDOW),
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
