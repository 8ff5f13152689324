use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::EventBusError;
use crate::inbox::InboxMessage;

/// The closed set of event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    Initialize,
    InitError,
    Ready,
    Subscribe,
    Unsubscribe,
    Register,
    ChangePermission,
    PermissionDefault,
    PermissionDenied,
    PermissionGranted,
    ReceivePush,
    ShowNotification,
    NotificationClick,
    HideNotification,
    ReceiveInboxMessage,
    UpdateInboxMessages,
    Error,
}

impl EventName {
    pub const ALL: &'static [EventName] = &[
        Self::Initialize,
        Self::InitError,
        Self::Ready,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Register,
        Self::ChangePermission,
        Self::PermissionDefault,
        Self::PermissionDenied,
        Self::PermissionGranted,
        Self::ReceivePush,
        Self::ShowNotification,
        Self::NotificationClick,
        Self::HideNotification,
        Self::ReceiveInboxMessage,
        Self::UpdateInboxMessages,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::InitError => "init-error",
            Self::Ready => "ready",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Register => "register",
            Self::ChangePermission => "change-permission",
            Self::PermissionDefault => "permission-default",
            Self::PermissionDenied => "permission-denied",
            Self::PermissionGranted => "permission-granted",
            Self::ReceivePush => "receive-push",
            Self::ShowNotification => "show-notification",
            Self::NotificationClick => "notification-click",
            Self::HideNotification => "hide-notification",
            Self::ReceiveInboxMessage => "receive-inbox-message",
            Self::UpdateInboxMessages => "update-inbox-messages",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| EventBusError::InvalidPattern(s.to_string()))
    }
}

/// Notification permission as the host reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionState {
    Default,
    Denied,
    Granted,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Denied => "denied",
            Self::Granted => "granted",
        }
    }

    /// The event announcing this state specifically.
    pub fn event_payload(&self) -> EventPayload {
        match self {
            Self::Default => EventPayload::PermissionDefault,
            Self::Denied => EventPayload::PermissionDenied,
            Self::Granted => EventPayload::PermissionGranted,
        }
    }
}

impl std::str::FromStr for PermissionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "denied" => Ok(Self::Denied),
            "granted" => Ok(Self::Granted),
            other => Err(format!("unknown permission state {other}")),
        }
    }
}

/// Identifiers of a subscribed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentifiers {
    /// Stable per-profile hardware id
    pub device_id: String,
    /// Token issued by the native push backend
    pub token: String,
    /// Web Push `p256dh` key
    pub public_key: Option<String>,
    /// Web Push `auth` secret
    pub auth_token: Option<String>,
}

/// The event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Derived from the payload, so a name can never carry the wrong schema
    pub name: EventName,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Links related events; assigned on publish when absent
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: EventSource, payload: EventPayload) -> Self {
        Self {
            name: payload.name(),
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(source, payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Internal component
    System(String),
    /// The embedding page or service worker
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Lifecycle ─────────────────────────────────────────────────
    Initialize {
        application_code: String,
    },
    InitError {
        reason: String,
    },
    Ready {
        provider_code: u16,
    },
    Error {
        component: String,
        message: String,
    },

    // ── Subscription ──────────────────────────────────────────────
    Subscribe {
        identifiers: DeviceIdentifiers,
    },
    Unsubscribe,
    Register {
        hwid: String,
    },
    ChangePermission {
        state: PermissionState,
    },
    PermissionDefault,
    PermissionDenied,
    PermissionGranted,

    // ── Push / notification ───────────────────────────────────────
    ReceivePush {
        payload: serde_json::Value,
    },
    ShowNotification {
        title: String,
        body: String,
        hash: Option<String>,
    },
    NotificationClick {
        hash: Option<String>,
        url: Option<String>,
    },
    HideNotification {
        hash: Option<String>,
    },

    // ── Inbox ─────────────────────────────────────────────────────
    ReceiveInboxMessage {
        message: InboxMessage,
    },
    UpdateInboxMessages {
        added: Vec<String>,
        updated: Vec<String>,
        deleted: Vec<String>,
    },
}

impl EventPayload {
    pub fn name(&self) -> EventName {
        match self {
            Self::Initialize { .. } => EventName::Initialize,
            Self::InitError { .. } => EventName::InitError,
            Self::Ready { .. } => EventName::Ready,
            Self::Error { .. } => EventName::Error,
            Self::Subscribe { .. } => EventName::Subscribe,
            Self::Unsubscribe => EventName::Unsubscribe,
            Self::Register { .. } => EventName::Register,
            Self::ChangePermission { .. } => EventName::ChangePermission,
            Self::PermissionDefault => EventName::PermissionDefault,
            Self::PermissionDenied => EventName::PermissionDenied,
            Self::PermissionGranted => EventName::PermissionGranted,
            Self::ReceivePush { .. } => EventName::ReceivePush,
            Self::ShowNotification { .. } => EventName::ShowNotification,
            Self::NotificationClick { .. } => EventName::NotificationClick,
            Self::HideNotification { .. } => EventName::HideNotification,
            Self::ReceiveInboxMessage { .. } => EventName::ReceiveInboxMessage,
            Self::UpdateInboxMessages { .. } => EventName::UpdateInboxMessages,
        }
    }
}

/// A registered handler. Each delivery runs as its own task.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub trait EventBus: Send + Sync + 'static {
    /// Schedule delivery and return the event's correlation id.
    ///
    /// Handlers never run inside this call. Each one is spawned on the current
    /// tokio runtime; outside a runtime handler delivery is skipped with a
    /// warning and only [`listen`](EventBus::listen) streams see the event.
    fn publish(&self, event: Event) -> Uuid;

    fn subscribe(&self, name: EventName, handler: EventHandler) -> HandlerId;

    fn unsubscribe(&self, name: EventName, id: HandlerId) -> bool;

    /// Stream every event whose name matches a glob pattern (`"permission-*"`).
    fn listen(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;

    /// Drop every registered handler.
    fn clear(&self);
}

pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
    handlers: RwLock<HashMap<EventName, Vec<(HandlerId, EventHandler)>>>,
    next_handler_id: AtomicU64,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    fn handlers_for(&self, name: EventName) -> Vec<EventHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, mut event: Event) -> Uuid {
        let correlation_id = *event.correlation_id.get_or_insert_with(Uuid::new_v4);
        let handlers = self.handlers_for(event.name);

        if !handlers.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    for handler in handlers {
                        let event = event.clone();
                        runtime.spawn(async move { handler(event).await });
                    }
                }
                Err(_) => {
                    warn!(event = %event.name, "no async runtime, handler delivery skipped");
                }
            }
        }

        trace!(event = %event.name, %correlation_id, "event published");
        let _ = self.sender.send(event);
        correlation_id
    }

    fn subscribe(&self, name: EventName, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, name: EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = handlers.get_mut(&name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        before != entries.len()
    }

    fn listen(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        if pattern.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        Ok(EventSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }

    fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matcher.is_match(event.name.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}
