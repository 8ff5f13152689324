//! The Beacon application context.
//!
//! [`Beacon::init`] computes the platform profile once, opens the local store and
//! wires the event bus, subscription coordinator and inbox manager together.
//! Every other component is reached through the context; nothing is global.

use std::sync::Arc;

use beacon_api::HttpPushApi;
use beacon_core::api::{ApiError, PushApi, PushStatRequest};
use beacon_core::config::{Config, ConfigError};
use beacon_core::event::{
    BroadcastEventBus, DeviceIdentifiers, Event, EventBus, EventHandler, EventName,
    EventPayload, EventSource, EventSubscription, HandlerId, PermissionState,
};
use beacon_core::platform::{HostEnvironment, PlatformProfile, detect};
use beacon_core::{BeaconError, EventBusError};
use beacon_inbox::{InboxError, InboxManager, InboxSettings};
use beacon_notifications::{ClickReport, Notification, NotificationError};
use beacon_push::{
    CoordinatorSettings, DriverRegistry, PushBackend, PushError, SubscriptionCoordinator,
    SubscriptionState,
};
use beacon_storage::{NativeDatabase, StorageError, Store, open_store};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use beacon_core::{api, config, event, inbox, logging, platform};
pub use beacon_notifications as notifications;
pub use beacon_push::{BackendError, DriverParams, NativeSubscription};

const COMPONENT: &str = "beacon";

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] BeaconError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] ApiError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

pub struct Beacon {
    config: Config,
    profile: PlatformProfile,
    bus: Arc<BroadcastEventBus>,
    store: Arc<Store<NativeDatabase>>,
    api: Arc<dyn PushApi>,
    coordinator: SubscriptionCoordinator<NativeDatabase>,
    inbox: InboxManager<NativeDatabase>,
    hwid: String,
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beacon").field("hwid", &self.hwid).finish_non_exhaustive()
    }
}

impl Beacon {
    /// Build the context against the configured remote endpoint.
    pub async fn connect(
        config: Config,
        environment: &HostEnvironment,
        backend: Arc<dyn PushBackend>,
    ) -> Result<Self, SdkError> {
        let api = HttpPushApi::new(&config.application.api_endpoint)?;
        Self::init(config, environment, backend, Arc::new(api)).await
    }

    /// Build the context and initialize the push driver.
    ///
    /// Storage failures fail the call; there is no in-memory fallback. A driver
    /// that cannot be initialized does not: the context comes up with its
    /// subscription state [`SubscriptionState::Unavailable`].
    pub async fn init(
        config: Config,
        environment: &HostEnvironment,
        backend: Arc<dyn PushBackend>,
        api: Arc<dyn PushApi>,
    ) -> Result<Self, SdkError> {
        let profile = detect(environment);
        info!(
            browser = ?profile.browser,
            os = ?profile.os,
            mechanism = ?profile.mechanism,
            provider = %profile.provider_code,
            "platform detected"
        );

        let bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        publish(
            bus.as_ref(),
            EventPayload::Initialize {
                application_code: config.application.code.clone(),
            },
        );

        let path = config.storage.resolved_path();
        let store = match open_store(&path).await {
            Ok(store) => Arc::new(store),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to open store");
                publish(
                    bus.as_ref(),
                    EventPayload::InitError {
                        reason: error.to_string(),
                    },
                );
                return Err(error.into());
            }
        };
        debug!(path = %path.display(), "store opened");

        let coordinator = SubscriptionCoordinator::new(
            store.clone(),
            bus.clone(),
            api.clone(),
            backend,
            profile.clone(),
            DriverRegistry::from_config(&config),
            CoordinatorSettings::from_config(&config),
        );
        let hwid = coordinator.hwid().await?;
        let inbox = InboxManager::new(
            store.clone(),
            bus.clone(),
            api.clone(),
            InboxSettings::from_config(&config, &hwid, profile.provider_code.code()),
        );

        if let Err(error) = coordinator.initialize().await {
            warn!(error = %error, "push is unavailable in this context");
        }

        info!(%hwid, state = ?coordinator.state(), "beacon initialized");
        Ok(Self {
            config,
            profile,
            bus,
            store,
            api,
            coordinator,
            inbox,
            hwid,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    pub fn hwid(&self) -> &str {
        &self.hwid
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &SubscriptionCoordinator<NativeDatabase> {
        &self.coordinator
    }

    pub fn inbox(&self) -> &InboxManager<NativeDatabase> {
        &self.inbox
    }

    pub fn store(&self) -> &Store<NativeDatabase> {
        &self.store
    }

    // ── Events ────────────────────────────────────────────────────

    pub fn on(&self, name: EventName, handler: EventHandler) -> HandlerId {
        self.bus.subscribe(name, handler)
    }

    pub fn off(&self, name: EventName, id: HandlerId) -> bool {
        self.bus.unsubscribe(name, id)
    }

    pub fn listen(&self, pattern: &str) -> Result<EventSubscription, SdkError> {
        Ok(self.bus.listen(pattern)?)
    }

    // ── Subscription ──────────────────────────────────────────────

    pub async fn subscribe(&self) -> Result<DeviceIdentifiers, PushError> {
        self.coordinator.subscribe().await
    }

    pub async fn unsubscribe(&self) -> Result<bool, PushError> {
        self.coordinator.unsubscribe().await
    }

    pub async fn is_subscribed(&self) -> Result<bool, PushError> {
        self.coordinator.is_subscribed().await
    }

    pub async fn get_permission_state(&self) -> Result<PermissionState, PushError> {
        self.coordinator.get_permission_state().await
    }

    pub async fn get_device_identifiers(&self) -> Result<Option<DeviceIdentifiers>, PushError> {
        self.coordinator.get_device_identifiers().await
    }

    // ── Notifications ─────────────────────────────────────────────

    /// Handle a push delivered by the native backend.
    ///
    /// The raw payload is logged before it is normalized, so a payload that
    /// cannot be shown is still on record. Storage and payload failures are
    /// reported on the bus as `error` before they are returned.
    pub async fn receive_push(&self, payload: Value) -> Result<Notification, SdkError> {
        let result = self.show_push(payload).await;
        if let Err(error @ (SdkError::Storage(_) | SdkError::Notification(_))) = &result {
            self.report(error).await;
        }
        result
    }

    async fn show_push(&self, payload: Value) -> Result<Notification, SdkError> {
        let received_at = Utc::now();
        publish(
            self.bus.as_ref(),
            EventPayload::ReceivePush {
                payload: payload.clone(),
            },
        );

        self.store
            .message_log()
            .append_at(received_at, "push", "push received", Some(&payload))
            .await?;

        let notification = Notification::from_payload(&payload)?;
        publish(
            self.bus.as_ref(),
            EventPayload::ShowNotification {
                title: notification.title.clone(),
                body: notification.body.clone(),
                hash: notification.data.hash.clone(),
            },
        );

        if let Some(hash) = notification.hash() {
            let request = self.push_stat_request(hash);
            if let Err(error) = self.api.message_delivery_event(request).await {
                warn!(%hash, error = %error, "delivery report failed");
            }
        }

        if let Some(message) = notification.inbox_message(received_at) {
            self.inbox.receive_from_push(message).await?;
        }
        Ok(notification)
    }

    /// The user clicked a shown notification.
    pub async fn notification_click(&self, report: ClickReport) -> Result<(), SdkError> {
        publish(
            self.bus.as_ref(),
            EventPayload::NotificationClick {
                hash: report.hash.clone(),
                url: report.url.clone(),
            },
        );

        if let Some(request) = report.push_stat(&self.config.application.code, &self.hwid) {
            if let Err(error) = self.api.push_stat(request).await {
                warn!(hash = ?report.hash, error = %error, "open report failed");
            }
        }
        if let Some(id) = &report.inbox_id {
            self.inbox.mark_opened(id).await?;
        }
        Ok(())
    }

    /// The user dismissed a shown notification.
    pub fn hide_notification(&self, hash: Option<String>) {
        publish(self.bus.as_ref(), EventPayload::HideNotification { hash });
    }

    // ── Housekeeping ──────────────────────────────────────────────

    /// Drop expired inbox messages and log entries older than the inbox
    /// retention window. Returns how many records were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, SdkError> {
        let cutoff = now - self.inbox.settings().retention;
        let inbox = self.inbox.purge_expired(now).await?;
        let messages = self.store.message_log().prune_older_than(cutoff).await?;
        let diagnostics = self.store.diagnostic_log().prune_older_than(cutoff).await?;
        debug!(inbox, messages, diagnostics, "purged expired records");
        Ok(inbox + messages + diagnostics)
    }

    /// Remove every bus handler and release the store.
    pub fn shutdown(self) {
        self.bus.clear();
        info!(hwid = %self.hwid, "beacon shut down");
    }

    /// Log, record in the diagnostic log and publish an `error` event.
    async fn report(&self, error: &SdkError) {
        warn!(error = %error, "push receipt failed");
        let message = error.to_string();
        if let Err(log_error) = self
            .store
            .diagnostic_log()
            .append(COMPONENT, &message, None)
            .await
        {
            warn!(error = %log_error, "failed to append to diagnostic log");
        }
        publish(
            self.bus.as_ref(),
            EventPayload::Error {
                component: COMPONENT.to_string(),
                message,
            },
        );
    }

    fn push_stat_request(&self, hash: &str) -> PushStatRequest {
        PushStatRequest {
            application: self.config.application.code.clone(),
            hwid: self.hwid.clone(),
            hash: hash.to_string(),
        }
    }
}

fn publish(bus: &dyn EventBus, payload: EventPayload) {
    bus.publish(Event::new(EventSource::System(COMPONENT.into()), payload));
}
