//! Request/response shapes of the remote push service and the trait every
//! transport implements.

use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote service returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// `registerDevice` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterDeviceRequest {
    pub application: String,
    pub hwid: String,
    pub push_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub device_type: u16,
    pub language: String,
    pub timezone: i32,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// `unregisterDevice` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRequest {
    pub application: String,
    pub hwid: String,
}

/// `messageDeliveryEvent` / `pushStat` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushStatRequest {
    pub application: String,
    pub hwid: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboxSyncRequest {
    pub application: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub hwid: String,
    #[serde(rename = "lastRequestCode")]
    pub last_request_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(rename = "lastRequestTime")]
    pub last_request_time: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct InboxSyncResponse {
    #[serde(default)]
    pub messages: Vec<RemoteInboxMessage>,
    /// Opaque cursor for the following page; empty when there is none
    #[serde(default)]
    pub next: String,
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default, alias = "newInboxCount")]
    pub new_inbox: u32,
}

/// An inbox message as the remote service encodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInboxMessage {
    pub inbox_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub order: i64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub send_date: i64,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub rt: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub action_type: u8,
    #[serde(default)]
    pub action_params: String,
    #[serde(default = "default_remote_status")]
    pub status: u8,
}

fn default_remote_status() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboxStatusRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub hwid: String,
    pub application: String,
    pub inbox_code: String,
    pub time: i64,
    pub status: u8,
    pub device_type: u16,
}

/// The remote push service.
///
/// Implementations own their timeouts: callers treat a slow request as
/// still pending.
pub trait PushApi: Send + Sync + 'static {
    fn register_device(&self, request: RegisterDeviceRequest) -> BoxFuture<'_, Result<(), ApiError>>;

    fn unregister_device(&self, request: DeviceRequest) -> BoxFuture<'_, Result<(), ApiError>>;

    fn get_inbox_messages(
        &self,
        request: InboxSyncRequest,
    ) -> BoxFuture<'_, Result<InboxSyncResponse, ApiError>>;

    fn inbox_status(&self, request: InboxStatusRequest) -> BoxFuture<'_, Result<(), ApiError>>;

    fn message_delivery_event(&self, request: PushStatRequest)
    -> BoxFuture<'_, Result<(), ApiError>>;

    fn push_stat(&self, request: PushStatRequest) -> BoxFuture<'_, Result<(), ApiError>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(i64),
    Text(String),
}

impl StringOrNumber {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) if s.is_empty() => Ok(0),
            Self::Text(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    StringOrNumber::deserialize(deserializer)?.into_i64()
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    Option::<StringOrNumber>::deserialize(deserializer)?
        .map(StringOrNumber::into_i64)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_uses_wire_field_names() {
        let request = InboxSyncRequest {
            application: "ABCDE-12345".to_string(),
            user_id: "u1".to_string(),
            hwid: "hw".to_string(),
            last_request_code: String::new(),
            count: None,
            last_request_time: 0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["lastRequestCode"], "");
        assert_eq!(json["lastRequestTime"], 0);
        assert!(json.get("count").is_none());
    }

    #[test]
    fn remote_message_accepts_string_numbers() {
        let message: RemoteInboxMessage = serde_json::from_str(
            r#"{"inbox_id":"m1","order":"17","send_date":"1700000000","rt":"","text":"hi"}"#,
        )
        .unwrap();
        assert_eq!(message.order, 17);
        assert_eq!(message.send_date, 1_700_000_000);
        assert_eq!(message.rt, Some(0));
        assert_eq!(message.status, 1);
    }

    #[test]
    fn sync_response_defaults_and_alias() {
        let response: InboxSyncResponse =
            serde_json::from_str(r#"{"messages":[],"newInboxCount":3}"#).unwrap();
        assert_eq!(response.new_inbox, 3);
        assert!(response.next.is_empty());
        assert!(response.deleted.is_empty());
    }
}
