//! Turns a received push payload into the notification the host displays, and
//! the click report the host posts back.

use beacon_core::api::PushStatRequest;
use beacon_core::inbox::{InboxAction, InboxMessage, InboxStatus};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    #[error("push payload is not a JSON object")]
    NotAnObject,

    #[error("push payload has neither a title nor a body")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationButton {
    pub title: String,
    pub url: Option<String>,
}

/// Carried with the shown notification and handed back on click.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Message hash used for delivery and open statistics
    pub hash: Option<String>,
    /// Page opened on click
    pub url: Option<String>,
    /// Application payload (`u`), decoded when it is a JSON string
    pub custom: Option<Value>,
}

/// The inbox entry announced alongside a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxDescriptor {
    pub id: String,
    pub removal_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub image: Option<String>,
    pub buttons: Vec<NotificationButton>,
    pub tag: Option<String>,
    pub data: NotificationData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<InboxDescriptor>,
}

impl Notification {
    /// Normalize a raw payload.
    ///
    /// Unknown keys are ignored. Numeric fields may arrive as strings.
    pub fn from_payload(payload: &Value) -> Result<Self, NotificationError> {
        let fields = payload.as_object().ok_or(NotificationError::NotAnObject)?;

        let title = text(fields, "header")
            .or_else(|| text(fields, "title"))
            .unwrap_or_default();
        let body = text(fields, "body")
            .or_else(|| text(fields, "message"))
            .unwrap_or_default();
        if title.is_empty() && body.is_empty() {
            return Err(NotificationError::Empty);
        }

        let buttons = fields
            .get("buttons")
            .and_then(Value::as_array)
            .map(|buttons| {
                buttons
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(|button| {
                        Some(NotificationButton {
                            title: text(button, "title")?,
                            url: text(button, "url"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let hash = text(fields, "p");
        let inbox = text(fields, "pw_inbox").map(|id| {
            let params = fields.get("inbox_params").and_then(Value::as_object);
            InboxDescriptor {
                id,
                removal_at: params
                    .and_then(|params| number(params, "rt"))
                    .filter(|rt| *rt > 0)
                    .and_then(|rt| Utc.timestamp_opt(rt, 0).single()),
                image: params.and_then(|params| text(params, "image")),
            }
        });

        let notification = Self {
            title,
            body,
            icon: text(fields, "icon"),
            image: text(fields, "image"),
            buttons,
            tag: text(fields, "tag"),
            data: NotificationData {
                hash,
                url: text(fields, "l"),
                custom: fields.get("u").map(decode_custom),
            },
            inbox,
        };
        debug!(
            hash = ?notification.data.hash,
            inbox = notification.inbox.is_some(),
            "push payload normalized"
        );
        Ok(notification)
    }

    pub fn hash(&self) -> Option<&str> {
        self.data.hash.as_deref()
    }

    /// The inbox message this push announces, if any.
    pub fn inbox_message(&self, received_at: DateTime<Utc>) -> Option<InboxMessage> {
        let descriptor = self.inbox.as_ref()?;
        Some(InboxMessage {
            id: descriptor.id.clone(),
            order: received_at.timestamp_millis(),
            created_at: received_at,
            removal_at: descriptor.removal_at,
            title: Some(self.title.clone()).filter(|title| !title.is_empty()),
            body: self.body.clone(),
            image: descriptor.image.clone().or_else(|| self.image.clone()),
            action: self
                .data
                .url
                .clone()
                .map_or(InboxAction::None, |url| InboxAction::Url { url }),
            status: InboxStatus::Delivered,
        })
    }
}

/// What the host posts back when the user clicks a shown notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickReport {
    pub hash: Option<String>,
    /// Page to open; a clicked button's url wins over the notification's
    pub url: Option<String>,
    /// Inbox message the clicked notification announced
    pub inbox_id: Option<String>,
}

impl ClickReport {
    pub fn for_notification(notification: &Notification, button: Option<usize>) -> Self {
        let button_url = button
            .and_then(|index| notification.buttons.get(index))
            .and_then(|button| button.url.clone());
        Self {
            hash: notification.data.hash.clone(),
            url: button_url.or_else(|| notification.data.url.clone()),
            inbox_id: notification.inbox.as_ref().map(|inbox| inbox.id.clone()),
        }
    }

    /// The `pushStat` request for this click. Clicks without a hash are not counted.
    pub fn push_stat(&self, application: &str, hwid: &str) -> Option<PushStatRequest> {
        Some(PushStatRequest {
            application: application.to_string(),
            hwid: hwid.to_string(),
            hash: self.hash.clone().filter(|hash| !hash.is_empty())?,
        })
    }
}

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn number(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Value::Number(value) => value.as_i64(),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

fn decode_custom(value: &Value) -> Value {
    match value {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}
