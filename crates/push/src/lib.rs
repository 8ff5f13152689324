//! Native push drivers and the subscription lifecycle that drives them.

pub mod backend;
pub mod coordinator;
pub mod driver;
pub mod registry;

pub use backend::{BackendError, NativeSubscription, PushBackend};
pub use coordinator::{CoordinatorSettings, SubscriptionCoordinator, SubscriptionState};
pub use driver::{Driver, DriverCapabilities, DriverKind, DriverParams};
pub use registry::DriverRegistry;

use beacon_core::api::ApiError;
use beacon_storage::StorageError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PushError {
    #[error("no usable push backend in this environment")]
    CapabilityUnavailable,

    #[error("push driver failed to initialize: {0}")]
    DriverInit(String),

    #[error("notification permission was not granted")]
    PermissionDenied,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Network(#[from] ApiError),

    #[error("native push error: {0}")]
    Backend(String),
}
