//! Entry points shared by the `publisher` and `consumer` binaries.
//!
//! Settings are loaded and validated before any link is built, so a
//! configuration error never costs a connection attempt.

use crate::connection::{ConsumeLink, PublishLink};
use crate::consumer::{ConsumeStats, Consumer};
use crate::error::Error;
use crate::handler::DeliveryHandler;
use crate::publisher::{PublishStats, Publisher};
use crate::settings::Settings;
use config::Environment;
use tokio_util::sync::CancellationToken;

/// Loads settings from `source`, builds a link with `connect` and publishes until stopped.
pub async fn run_publisher<L, F>(
    source: Environment,
    connect: F,
    shutdown: CancellationToken,
) -> Result<PublishStats, Error>
where
    L: PublishLink,
    F: FnOnce(&Settings) -> L,
{
    let settings = Settings::from_environment(source)?;
    let link = connect(&settings);

    let publisher = Publisher::start(link, settings.publisher.clone(), &shutdown).await?;
    let stats = publisher.run(shutdown).await?;
    log::info!(
        "Published {} confirmed, {} rejected, {} dropped, {} unsent; {} reconnect(s)",
        stats.confirmed,
        stats.rejected,
        stats.dropped,
        stats.unsent,
        stats.reconnects
    );
    Ok(stats)
}

/// Loads settings from `source`, builds a link with `connect` and consumes until stopped.
pub async fn run_consumer<L, H, F>(
    source: Environment,
    connect: F,
    handler: H,
    shutdown: CancellationToken,
) -> Result<ConsumeStats, Error>
where
    L: ConsumeLink,
    H: DeliveryHandler,
    F: FnOnce(&Settings) -> L,
{
    let settings = Settings::from_environment(source)?;
    let link = connect(&settings);

    let consumer = Consumer::subscribe(link, handler, settings.consumer.clone(), &shutdown).await?;
    let stats = consumer.run(shutdown).await?;
    log::info!(
        "Consumed {} acknowledged, {} requeued, {} abandoned; {} reconnect(s)",
        stats.acked,
        stats.requeued,
        stats.abandoned,
        stats.reconnects
    );
    Ok(stats)
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
pub fn stop_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Stop signal received. Shutting down.");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
