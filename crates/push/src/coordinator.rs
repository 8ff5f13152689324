use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use beacon_core::api::{DeviceRequest, PushApi, RegisterDeviceRequest};
use beacon_core::config::Config;
use beacon_core::event::{
    DeviceIdentifiers, Event, EventBus, EventPayload, EventSource, PermissionState,
};
use beacon_core::platform::PlatformProfile;
use beacon_storage::{Database, Store};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::PushError;
use crate::backend::{NativeSubscription, PushBackend};
use crate::driver::{Driver, DriverKind};
use crate::registry::DriverRegistry;

pub const KEY_HWID: &str = "params.hwid";
pub const KEY_PUSH_TOKEN: &str = "params.pushToken";
pub const KEY_PUBLIC_KEY: &str = "params.publicKey";
pub const KEY_AUTH_TOKEN: &str = "params.authToken";
/// Token the remote service last accepted via `registerDevice`
pub const KEY_REGISTERED_TOKEN: &str = "params.registeredToken";
pub const KEY_PERMISSION: &str = "permission.last";

const COMPONENT: &str = "push";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unknown,
    Detecting,
    DriverReady,
    Subscribing,
    Subscribed,
    Unsubscribing,
    Unsubscribed,
    /// The driver could not be selected or initialized. Sticky until
    /// [`SubscriptionCoordinator::initialize`] is called again.
    Unavailable,
}

/// Values reported alongside device registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub application_code: String,
    pub user_id: Option<String>,
    pub language: String,
    /// Offset from UTC in seconds
    pub timezone: i32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            application_code: config.application.code.clone(),
            user_id: config.application.user_id.clone(),
            language: "en".to_string(),
            timezone: chrono::Local::now().offset().local_minus_utc(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the subscribe/unsubscribe lifecycle of the session's one driver.
///
/// Every state-changing operation runs under a single async lock, so at most one
/// native subscribe is outstanding. A `subscribe()` that queued behind another
/// subscribe takes that call's outcome instead of issuing its own. The coordinator
/// is the only writer of the `params.*` keys.
pub struct SubscriptionCoordinator<D: Database> {
    store: Arc<Store<D>>,
    bus: Arc<dyn EventBus>,
    api: Arc<dyn PushApi>,
    backend: Arc<dyn PushBackend>,
    profile: PlatformProfile,
    registry: DriverRegistry,
    settings: CoordinatorSettings,
    driver: Mutex<Option<Driver>>,
    state: Mutex<SubscriptionState>,
    operation: tokio::sync::Mutex<()>,
    hwid_lock: tokio::sync::Mutex<()>,
    completed_subscribes: AtomicU64,
    last_subscribe: Mutex<Option<Result<DeviceIdentifiers, PushError>>>,
}

impl<D: Database> SubscriptionCoordinator<D> {
    pub fn new(
        store: Arc<Store<D>>,
        bus: Arc<dyn EventBus>,
        api: Arc<dyn PushApi>,
        backend: Arc<dyn PushBackend>,
        profile: PlatformProfile,
        registry: DriverRegistry,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            bus,
            api,
            backend,
            profile,
            registry,
            settings,
            driver: Mutex::new(None),
            state: Mutex::new(SubscriptionState::Unknown),
            operation: tokio::sync::Mutex::new(()),
            hwid_lock: tokio::sync::Mutex::new(()),
            completed_subscribes: AtomicU64::new(0),
            last_subscribe: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *lock(&self.state)
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    pub fn driver_kind(&self) -> Option<DriverKind> {
        lock(&self.driver).as_ref().map(Driver::kind)
    }

    /// Select and initialize the driver.
    ///
    /// This is the only way out of [`SubscriptionState::Unavailable`].
    pub async fn initialize(&self) -> Result<(), PushError> {
        let _guard = self.operation.lock().await;
        self.initialize_locked().await
    }

    pub async fn subscribe(&self) -> Result<DeviceIdentifiers, PushError> {
        self.ensure_available().await?;

        let observed = self.completed_subscribes.load(Ordering::Acquire);
        let _guard = self.operation.lock().await;
        if self.completed_subscribes.load(Ordering::Acquire) != observed {
            let joined = lock(&self.last_subscribe).clone();
            if let Some(outcome) = joined {
                debug!("subscribe coalesced into the call that completed while waiting");
                return outcome;
            }
        }
        if self.state() == SubscriptionState::Unavailable {
            return Err(PushError::CapabilityUnavailable);
        }

        let outcome = self.subscribe_locked().await;
        *lock(&self.last_subscribe) = Some(outcome.clone());
        self.completed_subscribes.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Returns whether anything was subscribed.
    pub async fn unsubscribe(&self) -> Result<bool, PushError> {
        self.ensure_available().await?;

        let _guard = self.operation.lock().await;
        *lock(&self.last_subscribe) = None;
        if self.state() == SubscriptionState::Unavailable {
            return Err(PushError::CapabilityUnavailable);
        }

        let result = self.unsubscribe_locked().await;
        if let Err(error) = &result {
            self.report(error).await;
        }
        result
    }

    /// Current permission, as the backend reports it.
    ///
    /// A change from the last observed value publishes `change-permission`; losing
    /// permission while subscribed drops the subscription.
    pub async fn get_permission_state(&self) -> Result<PermissionState, PushError> {
        self.ensure_available().await?;

        let _guard = self.operation.lock().await;
        let driver = self.driver()?;
        let result = async {
            let permission = driver.permission_state().await?;
            self.observe_permission(permission).await?;
            Ok::<_, PushError>(permission)
        }
        .await;
        if let Err(error) = &result {
            self.report(error).await;
        }
        result
    }

    pub async fn is_subscribed(&self) -> Result<bool, PushError> {
        self.ensure_available().await?;
        let driver = self.driver()?;
        Ok(self.stored_identifiers().await?.is_some() && driver.is_subscribed().await?)
    }

    /// Identifiers of the stored subscription. Never touches the backend.
    pub async fn get_device_identifiers(&self) -> Result<Option<DeviceIdentifiers>, PushError> {
        self.stored_identifiers().await
    }

    /// The stable device id, generated on first use.
    pub async fn hwid(&self) -> Result<String, PushError> {
        let _guard = self.hwid_lock.lock().await;
        let kv = self.store.key_value();
        if let Some(hwid) = kv.get::<String>(KEY_HWID).await? {
            return Ok(hwid);
        }
        let hwid = Uuid::new_v4().simple().to_string();
        kv.set(KEY_HWID, &hwid).await?;
        info!(%hwid, "generated device id");
        Ok(hwid)
    }

    async fn ensure_available(&self) -> Result<(), PushError> {
        match self.state() {
            SubscriptionState::Unavailable => Err(PushError::CapabilityUnavailable),
            SubscriptionState::Unknown => {
                let _guard = self.operation.lock().await;
                if self.state() == SubscriptionState::Unknown {
                    self.initialize_locked().await?;
                }
                match self.state() {
                    SubscriptionState::Unavailable => Err(PushError::CapabilityUnavailable),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn initialize_locked(&self) -> Result<(), PushError> {
        self.set_state(SubscriptionState::Detecting);
        *lock(&self.driver) = None;

        let selected = self.registry.select(&self.profile, Arc::clone(&self.backend));
        let driver = match selected {
            Ok(driver) => driver,
            Err(error) => return Err(self.fail_initialization(error).await),
        };
        if let Err(error) = driver.initialize().await {
            return Err(self.fail_initialization(error).await);
        }

        *lock(&self.driver) = Some(driver.clone());
        self.set_state(SubscriptionState::DriverReady);
        self.publish(EventPayload::Ready {
            provider_code: self.profile.provider_code.code(),
        });

        let restored = async {
            if self.stored_identifiers().await?.is_some() {
                if driver.is_subscribed().await? {
                    self.set_state(SubscriptionState::Subscribed);
                } else {
                    info!(driver = %driver.kind(), "stored subscription no longer exists natively");
                    self.drop_subscription().await?;
                }
            }
            let permission = driver.permission_state().await?;
            self.observe_permission(permission).await?;
            Ok::<_, PushError>(())
        }
        .await;
        if let Err(error) = &restored {
            self.report(error).await;
        }
        restored
    }

    async fn fail_initialization(&self, error: PushError) -> PushError {
        self.set_state(SubscriptionState::Unavailable);
        if error == PushError::CapabilityUnavailable {
            info!(mechanism = ?self.profile.mechanism, "no usable push backend");
        } else {
            self.report(&error).await;
        }
        self.publish(EventPayload::InitError {
            reason: error.to_string(),
        });
        error
    }

    async fn subscribe_locked(&self) -> Result<DeviceIdentifiers, PushError> {
        let driver = self.driver()?;
        let previous = self.state();
        self.set_state(SubscriptionState::Subscribing);

        match self.obtain_subscription(&driver).await {
            Ok(identifiers) => {
                self.set_state(SubscriptionState::Subscribed);
                self.publish(EventPayload::Subscribe {
                    identifiers: identifiers.clone(),
                });
                if let Err(error) = self.observe_permission(PermissionState::Granted).await {
                    self.report(&error).await;
                }
                self.register(&identifiers).await;
                Ok(identifiers)
            }
            Err(error) => {
                let lost = previous == SubscriptionState::Subscribed
                    && matches!(driver.is_subscribed().await, Ok(false));
                if lost {
                    warn!(driver = %driver.kind(), "resubscribe failed after the old subscription was dropped");
                    if let Err(error) = self.drop_subscription().await {
                        self.report(&error).await;
                    }
                } else {
                    self.set_state(match previous {
                        SubscriptionState::Subscribed => SubscriptionState::Subscribed,
                        _ => SubscriptionState::DriverReady,
                    });
                }
                if error == PushError::PermissionDenied {
                    let permission = driver
                        .permission_state()
                        .await
                        .unwrap_or(PermissionState::Denied);
                    if let Err(error) = self.observe_permission(permission).await {
                        self.report(&error).await;
                    }
                } else {
                    self.report(&error).await;
                }
                Err(error)
            }
        }
    }

    async fn obtain_subscription(&self, driver: &Driver) -> Result<DeviceIdentifiers, PushError> {
        if let Some(identifiers) = self.stored_identifiers().await? {
            if !driver.capabilities().reissues_on_resubscribe && driver.is_subscribed().await? {
                debug!(driver = %driver.kind(), "already subscribed, keeping stored identifiers");
                return Ok(identifiers);
            }
        }

        let native = driver.subscribe().await?;
        info!(driver = %driver.kind(), "native subscription obtained");
        self.persist_subscription(&native).await
    }

    async fn unsubscribe_locked(&self) -> Result<bool, PushError> {
        let driver = self.driver()?;
        let previous = self.state();
        self.set_state(SubscriptionState::Unsubscribing);

        let native = match driver.unsubscribe().await {
            Ok(native) => native,
            Err(error) => {
                self.set_state(previous);
                return Err(error);
            }
        };

        let stored = self.clear_subscription().await?;
        if !native && stored.is_none() {
            debug!("nothing to unsubscribe");
            self.set_state(previous);
            return Ok(false);
        }
        if let Some(identifiers) = &stored {
            self.unregister(identifiers).await;
        }

        self.set_state(SubscriptionState::Unsubscribed);
        self.publish(EventPayload::Unsubscribe);
        Ok(native || stored.is_some())
    }

    async fn stored_identifiers(&self) -> Result<Option<DeviceIdentifiers>, PushError> {
        let kv = self.store.key_value();
        let Some(token) = kv.get::<String>(KEY_PUSH_TOKEN).await? else {
            return Ok(None);
        };

        Ok(Some(DeviceIdentifiers {
            device_id: self.hwid().await?,
            token,
            public_key: kv.get(KEY_PUBLIC_KEY).await?,
            auth_token: kv.get(KEY_AUTH_TOKEN).await?,
        }))
    }

    async fn persist_subscription(
        &self,
        native: &NativeSubscription,
    ) -> Result<DeviceIdentifiers, PushError> {
        let device_id = self.hwid().await?;
        let kv = self.store.key_value();

        kv.set(KEY_PUSH_TOKEN, &native.token).await?;
        match &native.public_key {
            Some(key) => kv.set(KEY_PUBLIC_KEY, key).await?,
            None => {
                kv.delete(KEY_PUBLIC_KEY).await?;
            }
        }
        match &native.auth_token {
            Some(token) => kv.set(KEY_AUTH_TOKEN, token).await?,
            None => {
                kv.delete(KEY_AUTH_TOKEN).await?;
            }
        }

        Ok(DeviceIdentifiers {
            device_id,
            token: native.token.clone(),
            public_key: native.public_key.clone(),
            auth_token: native.auth_token.clone(),
        })
    }

    /// Forget the push token and keys. The device id stays.
    async fn clear_subscription(&self) -> Result<Option<DeviceIdentifiers>, PushError> {
        let stored = self.stored_identifiers().await?;
        let kv = self.store.key_value();
        for key in [KEY_PUSH_TOKEN, KEY_PUBLIC_KEY, KEY_AUTH_TOKEN, KEY_REGISTERED_TOKEN] {
            kv.delete(key).await?;
        }
        Ok(stored)
    }

    async fn observe_permission(&self, permission: PermissionState) -> Result<(), PushError> {
        let kv = self.store.key_value();
        let last: Option<PermissionState> = kv.get(KEY_PERMISSION).await?;
        if last == Some(permission) {
            return Ok(());
        }

        kv.set(KEY_PERMISSION, &permission).await?;
        info!(from = ?last, to = %permission.as_str(), "notification permission changed");
        self.publish(EventPayload::ChangePermission { state: permission });
        self.publish(permission.event_payload());

        if permission != PermissionState::Granted && self.state() == SubscriptionState::Subscribed {
            self.drop_subscription().await?;
        }
        Ok(())
    }

    /// Forget a subscription the backend no longer holds.
    async fn drop_subscription(&self) -> Result<(), PushError> {
        if let Some(identifiers) = self.clear_subscription().await? {
            self.unregister(&identifiers).await;
        }
        self.set_state(SubscriptionState::Unsubscribed);
        self.publish(EventPayload::Unsubscribe);
        Ok(())
    }

    /// Tell the remote service about the token. Failure is reported, not returned;
    /// the next `subscribe()` tries again.
    async fn register(&self, identifiers: &DeviceIdentifiers) {
        let kv = self.store.key_value();
        let registered = kv
            .get::<String>(KEY_REGISTERED_TOKEN)
            .await
            .ok()
            .flatten();
        if registered.as_deref() == Some(identifiers.token.as_str()) {
            return;
        }

        let request = RegisterDeviceRequest {
            application: self.settings.application_code.clone(),
            hwid: identifiers.device_id.clone(),
            push_token: identifiers.token.clone(),
            public_key: identifiers.public_key.clone(),
            auth_token: identifiers.auth_token.clone(),
            device_type: self.profile.provider_code.code(),
            language: self.settings.language.clone(),
            timezone: self.settings.timezone,
            user_id: self.settings.user_id.clone(),
        };

        match self.api.register_device(request).await {
            Ok(()) => {
                if let Err(error) = kv.set(KEY_REGISTERED_TOKEN, &identifiers.token).await {
                    self.report(&error.into()).await;
                }
                info!(hwid = %identifiers.device_id, "device registered");
                self.publish(EventPayload::Register {
                    hwid: identifiers.device_id.clone(),
                });
            }
            Err(error) => self.report(&error.into()).await,
        }
    }

    async fn unregister(&self, identifiers: &DeviceIdentifiers) {
        let request = DeviceRequest {
            application: self.settings.application_code.clone(),
            hwid: identifiers.device_id.clone(),
        };
        if let Err(error) = self.api.unregister_device(request).await {
            self.report(&error.into()).await;
        }
    }

    fn driver(&self) -> Result<Driver, PushError> {
        lock(&self.driver)
            .clone()
            .ok_or(PushError::CapabilityUnavailable)
    }

    fn set_state(&self, next: SubscriptionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = ?*state, to = ?next, "subscription state changed");
            *state = next;
        }
    }

    fn publish(&self, payload: EventPayload) -> Uuid {
        self.bus
            .publish(Event::new(EventSource::System(COMPONENT.into()), payload))
    }

    /// Log, record in the diagnostic log and publish an `error` event.
    async fn report(&self, error: &PushError) {
        warn!(error = %error, "push operation failed");
        let message = error.to_string();
        if let Err(log_error) = self
            .store
            .diagnostic_log()
            .append(COMPONENT, &message, None)
            .await
        {
            warn!(error = %log_error, "failed to append to diagnostic log");
        }
        self.publish(EventPayload::Error {
            component: COMPONENT.to_string(),
            message,
        });
    }
}
