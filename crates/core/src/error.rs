use thiserror::Error;

/// Errors raised by the shared infrastructure in this crate.
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// A specialized Result type for Beacon operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Event bus closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
