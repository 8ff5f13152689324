pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod inbox;
pub mod logging;
pub mod platform;

pub use error::{BeaconError, EventBusError, Result};
