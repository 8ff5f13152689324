use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::api::RemoteInboxMessage;

/// Status of an inbox message.
///
/// The discriminants order the statuses as a lattice: a message only ever moves to
/// a greater status, and `Deleted` absorbs everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum InboxStatus {
    Delivered = 1,
    Read = 2,
    Open = 3,
    Deleted = 4,
}

impl InboxStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            3 => Some(Self::Open),
            4 => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Lattice join. Never moves backwards.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Open => "open",
            Self::Deleted => "deleted",
        }
    }
}

impl From<InboxStatus> for u8 {
    fn from(status: InboxStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for InboxStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown inbox status code {code}"))
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when the user acts on an inbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboxAction {
    None,
    Url { url: String },
    RichMedia { code: String },
    DeepLink { link: String },
}

impl InboxAction {
    /// Decode the wire `action_type` / `action_params` pair.
    ///
    /// Unknown types and unparsable parameters degrade to `None`.
    pub fn from_wire(action_type: u8, action_params: &str) -> Self {
        let params: serde_json::Value =
            serde_json::from_str(action_params).unwrap_or(serde_json::Value::Null);
        let field = |name: &str| {
            params
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };

        match action_type {
            1 => field("l").map_or(Self::None, |url| Self::Url { url }),
            2 => field("rm").map_or(Self::None, |code| Self::RichMedia { code }),
            3 => field("link").map_or(Self::None, |link| Self::DeepLink { link }),
            _ => Self::None,
        }
    }
}

/// A locally mirrored inbox message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    /// Server-assigned unique id
    pub id: String,

    /// Monotonic server ordering key; newer messages have larger keys
    pub order: i64,

    pub created_at: DateTime<Utc>,

    /// The message disappears from the inbox after this instant
    pub removal_at: Option<DateTime<Utc>>,

    pub title: Option<String>,
    pub body: String,
    pub image: Option<String>,
    pub action: InboxAction,
    pub status: InboxStatus,
}

impl InboxMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.removal_at.is_some_and(|removal_at| removal_at <= now)
    }

    /// Shown to the user: neither deleted nor expired.
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.status != InboxStatus::Deleted && !self.is_expired(now)
    }

    pub fn is_unread(&self) -> bool {
        self.status == InboxStatus::Delivered
    }

    pub fn has_no_action_performed(&self) -> bool {
        matches!(self.status, InboxStatus::Delivered | InboxStatus::Read)
    }
}

impl From<RemoteInboxMessage> for InboxMessage {
    fn from(remote: RemoteInboxMessage) -> Self {
        let action = InboxAction::from_wire(remote.action_type, &remote.action_params);
        let created_at = timestamp(remote.send_date).unwrap_or_else(Utc::now);
        let removal_at = remote.rt.filter(|rt| *rt > 0).and_then(timestamp);
        let status = InboxStatus::from_code(remote.status).unwrap_or(InboxStatus::Delivered);

        Self {
            id: remote.inbox_id,
            order: remote.order,
            created_at,
            removal_at,
            title: remote.title.filter(|title| !title.is_empty()),
            body: remote.text,
            image: remote.image.filter(|image| !image.is_empty()),
            action,
            status,
        }
    }
}

fn timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn remote(status: u8) -> RemoteInboxMessage {
        RemoteInboxMessage {
            inbox_id: "m1".to_string(),
            order: 42,
            send_date: 1_700_000_000,
            rt: Some(1_800_000_000),
            title: Some("Hello".to_string()),
            text: "Body".to_string(),
            image: Some(String::new()),
            action_type: 1,
            action_params: r#"{"l":"https://example.com"}"#.to_string(),
            status,
        }
    }

    #[test]
    fn status_merge_never_regresses() {
        use InboxStatus::*;
        let all = [Delivered, Read, Open, Deleted];
        for a in all {
            for b in all {
                let merged = a.merge(b);
                assert!(merged >= a && merged >= b);
            }
        }
        assert_eq!(Read.merge(Delivered), Read);
        assert_eq!(Deleted.merge(Open), Deleted);
    }

    #[test]
    fn status_serializes_as_integer_code() {
        assert_eq!(serde_json::to_string(&InboxStatus::Open).unwrap(), "3");
        let status: InboxStatus = serde_json::from_str("2").unwrap();
        assert_eq!(status, InboxStatus::Read);
        assert!(serde_json::from_str::<InboxStatus>("9").is_err());
    }

    #[test]
    fn action_decoding() {
        assert_eq!(
            InboxAction::from_wire(1, r#"{"l":"https://example.com"}"#),
            InboxAction::Url {
                url: "https://example.com".to_string()
            }
        );
        assert_eq!(
            InboxAction::from_wire(2, r#"{"rm":"rm-code"}"#),
            InboxAction::RichMedia {
                code: "rm-code".to_string()
            }
        );
        assert_eq!(
            InboxAction::from_wire(3, r#"{"link":"app://open"}"#),
            InboxAction::DeepLink {
                link: "app://open".to_string()
            }
        );
        assert_eq!(InboxAction::from_wire(1, "not json"), InboxAction::None);
        assert_eq!(InboxAction::from_wire(7, "{}"), InboxAction::None);
    }

    #[test]
    fn converts_remote_message() {
        let message = InboxMessage::from(remote(1));
        assert_eq!(message.id, "m1");
        assert_eq!(message.order, 42);
        assert_eq!(message.status, InboxStatus::Delivered);
        assert_eq!(message.title.as_deref(), Some("Hello"));
        assert!(message.image.is_none());
        assert_eq!(message.created_at.timestamp(), 1_700_000_000);
        assert_eq!(
            message.removal_at.map(|rt| rt.timestamp()),
            Some(1_800_000_000)
        );
    }

    #[test]
    fn unknown_remote_status_defaults_to_delivered() {
        assert_eq!(InboxMessage::from(remote(0)).status, InboxStatus::Delivered);
    }

    #[test]
    fn visibility_and_counts() {
        let now = Utc::now();
        let mut message = InboxMessage::from(remote(1));
        message.removal_at = Some(now + Duration::hours(1));
        assert!(message.is_visible(now));
        assert!(message.is_unread());
        assert!(message.has_no_action_performed());

        message.status = InboxStatus::Read;
        assert!(!message.is_unread());
        assert!(message.has_no_action_performed());

        message.status = InboxStatus::Open;
        assert!(!message.has_no_action_performed());

        assert!(!message.is_visible(now + Duration::hours(2)));

        message.status = InboxStatus::Deleted;
        assert!(!message.is_visible(now));
    }
}
