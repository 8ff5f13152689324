use std::sync::Arc;

use beacon_core::event::PermissionState;
use tracing::{debug, info};

use crate::PushError;
use crate::backend::{BackendError, NativeSubscription, PushBackend};

/// What a driver variant can do. Fixed per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub can_subscribe: bool,
    /// The native backend can drop a subscription programmatically
    pub can_unsubscribe: bool,
    /// Rotating a token requires dropping the old subscription first
    pub needs_unsubscribe_before_resubscribe: bool,
    /// `subscribe()` while subscribed asks the backend again instead of returning
    /// the stored identifiers
    pub reissues_on_resubscribe: bool,
    /// Initialization registers a service worker
    pub initializes_worker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Worker,
    Safari,
    Extension,
}

impl DriverKind {
    pub const fn capabilities(self) -> DriverCapabilities {
        match self {
            Self::Worker => DriverCapabilities {
                can_subscribe: true,
                can_unsubscribe: true,
                needs_unsubscribe_before_resubscribe: true,
                reissues_on_resubscribe: true,
                initializes_worker: true,
            },
            Self::Safari => DriverCapabilities {
                can_subscribe: true,
                can_unsubscribe: false,
                needs_unsubscribe_before_resubscribe: false,
                reissues_on_resubscribe: false,
                initializes_worker: false,
            },
            Self::Extension => DriverCapabilities {
                can_subscribe: true,
                can_unsubscribe: true,
                needs_unsubscribe_before_resubscribe: false,
                reissues_on_resubscribe: false,
                initializes_worker: false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Safari => "safari",
            Self::Extension => "extension",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific initialization parameters; the variant names the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverParams {
    Worker {
        service_worker_url: String,
        scope: String,
        application_server_key: Option<String>,
    },
    Safari {
        website_push_id: String,
        web_service_url: String,
        /// Sent with Safari's permission request so the push package can be built
        application_code: String,
    },
    Extension {
        sender_id: String,
    },
}

impl DriverParams {
    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Worker { .. } => DriverKind::Worker,
            Self::Safari { .. } => DriverKind::Safari,
            Self::Extension { .. } => DriverKind::Extension,
        }
    }
}

/// The one driver a session uses.
#[derive(Clone)]
pub struct Driver {
    params: DriverParams,
    backend: Arc<dyn PushBackend>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn classify(error: BackendError) -> PushError {
    match error {
        BackendError::PermissionDenied => PushError::PermissionDenied,
        other => PushError::Backend(other.to_string()),
    }
}

impl Driver {
    pub fn new(params: DriverParams, backend: Arc<dyn PushBackend>) -> Self {
        Self { params, backend }
    }

    pub fn kind(&self) -> DriverKind {
        self.params.kind()
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        self.kind().capabilities()
    }

    pub fn params(&self) -> &DriverParams {
        &self.params
    }

    pub async fn initialize(&self) -> Result<(), PushError> {
        self.backend
            .initialize(&self.params)
            .await
            .map_err(|error| PushError::DriverInit(error.to_string()))?;
        info!(driver = %self.kind(), "push driver initialized");
        Ok(())
    }

    pub async fn permission_state(&self) -> Result<PermissionState, PushError> {
        self.backend.permission_state().await.map_err(classify)
    }

    pub async fn is_subscribed(&self) -> Result<bool, PushError> {
        Ok(self
            .backend
            .current_subscription()
            .await
            .map_err(classify)?
            .is_some())
    }

    pub async fn current_subscription(&self) -> Result<Option<NativeSubscription>, PushError> {
        self.backend.current_subscription().await.map_err(classify)
    }

    /// Ask for permission when needed, then obtain a native subscription.
    ///
    /// A denied or dismissed prompt is [`PushError::PermissionDenied`].
    pub async fn subscribe(&self) -> Result<NativeSubscription, PushError> {
        let mut permission = self.permission_state().await?;
        if permission == PermissionState::Default {
            permission = self
                .backend
                .request_permission(&self.params)
                .await
                .map_err(classify)?;
        }
        if permission != PermissionState::Granted {
            debug!(driver = %self.kind(), permission = %permission.as_str(), "permission not granted");
            return Err(PushError::PermissionDenied);
        }

        let capabilities = self.capabilities();
        if capabilities.needs_unsubscribe_before_resubscribe && self.is_subscribed().await? {
            debug!(driver = %self.kind(), "dropping previous native subscription before resubscribing");
            self.backend.unsubscribe().await.map_err(classify)?;
        }

        self.backend.subscribe(&self.params).await.map_err(classify)
    }

    /// Drop the native subscription. Drivers that cannot unsubscribe
    /// programmatically report `false` without touching the backend.
    pub async fn unsubscribe(&self) -> Result<bool, PushError> {
        if !self.capabilities().can_unsubscribe {
            debug!(driver = %self.kind(), "driver cannot unsubscribe natively");
            return Ok(false);
        }
        self.backend.unsubscribe().await.map_err(classify)
    }
}
