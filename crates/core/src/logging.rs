use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::BeaconError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails instead of panicking when a
/// subscriber is already installed, so embedders that bring their own keep it.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), BeaconError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))
        .map_err(|error| BeaconError::Logging(error.to_string()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|error| BeaconError::Logging(error.to_string()))?;

    tracing::debug!(level = %config.level, "tracing initialized");
    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("warn,beacon={level},beacon_core={level},beacon_storage={level},beacon_push={level},beacon_inbox={level},beacon_notifications={level},beacon_api={level}")
}
