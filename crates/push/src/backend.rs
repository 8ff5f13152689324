//! The seam between drivers and the host's native push machinery.

use beacon_core::event::PermissionState;
use futures::future::BoxFuture;

use crate::driver::DriverParams;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("the user denied notification permission")]
    PermissionDenied,

    #[error("native push is not supported here: {0}")]
    Unsupported(String),

    #[error("native push call failed: {0}")]
    Failed(String),
}

/// Credentials the native backend issued for this profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSubscription {
    pub token: String,
    /// Web Push `p256dh` key
    pub public_key: Option<String>,
    /// Web Push `auth` secret
    pub auth_token: Option<String>,
}

/// Native push operations a host provides.
///
/// One implementation per host (browser bridge, extension runtime, test fake). The
/// `params` tell it which mechanism the selected driver speaks. Permission prompts
/// are user-gesture gated on every host, so `request_permission` reports the
/// answer and never retries.
pub trait PushBackend: Send + Sync + 'static {
    fn initialize(&self, params: &DriverParams) -> BoxFuture<'_, Result<(), BackendError>>;

    fn permission_state(&self) -> BoxFuture<'_, Result<PermissionState, BackendError>>;

    fn request_permission(
        &self,
        params: &DriverParams,
    ) -> BoxFuture<'_, Result<PermissionState, BackendError>>;

    fn subscribe(
        &self,
        params: &DriverParams,
    ) -> BoxFuture<'_, Result<NativeSubscription, BackendError>>;

    /// The subscription the host currently holds, if any.
    fn current_subscription(
        &self,
    ) -> BoxFuture<'_, Result<Option<NativeSubscription>, BackendError>>;

    /// Returns whether a subscription existed.
    fn unsubscribe(&self) -> BoxFuture<'_, Result<bool, BackendError>>;
}
