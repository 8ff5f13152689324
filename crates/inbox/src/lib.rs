//! Local mirror of the remote inbox.
//!
//! The store is the source of truth for the UI. Status transitions are applied
//! locally and published before the remote service hears about them; a failed
//! status report is logged and left for the next full sync to reconcile.

use std::sync::Arc;

use beacon_core::api::{ApiError, InboxStatusRequest, InboxSyncRequest, PushApi};
use beacon_core::config::Config;
use beacon_core::event::{Event, EventBus, EventPayload, EventSource};
use beacon_core::inbox::{InboxMessage, InboxStatus};
use beacon_storage::inbox::{InboxFilter, MergeOutcome};
use beacon_storage::{Database, StorageError, Store};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

pub const KEY_LAST_REQUEST_CODE: &str = "inbox.lastRequestCode";
pub const KEY_LAST_REQUEST_TIME: &str = "inbox.lastRequestTime";

const COMPONENT: &str = "inbox";

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Network(#[from] ApiError),
}

/// Identity and paging values sent with every inbox request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxSettings {
    pub application_code: String,
    /// Falls back to the device id when the application has no user id
    pub user_id: String,
    pub hwid: String,
    pub device_type: u16,
    pub page_size: u32,
    /// How long a deleted message is kept before it is purged
    pub retention: Duration,
}

impl InboxSettings {
    pub fn from_config(config: &Config, hwid: &str, device_type: u16) -> Self {
        Self {
            application_code: config.application.code.clone(),
            user_id: config
                .application
                .user_id
                .clone()
                .unwrap_or_else(|| hwid.to_string()),
            hwid: hwid.to_string(),
            device_type,
            page_size: config.inbox.page_size,
            retention: Duration::days(i64::from(config.inbox.retention_days)),
        }
    }
}

/// Result of one sync page.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Every message in the page, carrying its status after the merge
    pub messages: Vec<InboxMessage>,
    /// Opaque cursor for the following page; empty when there is none
    pub next_cursor: String,
    /// Ids the remote service confirmed as deleted
    pub deleted: Vec<String>,
    pub new_count: u32,
}

/// Sole writer of inbox message status.
pub struct InboxManager<D: Database> {
    store: Arc<Store<D>>,
    bus: Arc<dyn EventBus>,
    api: Arc<dyn PushApi>,
    settings: InboxSettings,
    sync_lock: tokio::sync::Mutex<()>,
}

impl<D: Database> InboxManager<D> {
    pub fn new(
        store: Arc<Store<D>>,
        bus: Arc<dyn EventBus>,
        api: Arc<dyn PushApi>,
        settings: InboxSettings,
    ) -> Self {
        Self {
            store,
            bus,
            api,
            settings,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &InboxSettings {
        &self.settings
    }

    /// Fetch one page and merge it into the store.
    ///
    /// `cursor` is forwarded verbatim; an empty cursor starts from the beginning.
    /// A stale page never moves a stored status backwards.
    pub async fn sync(
        &self,
        last_request_time: i64,
        cursor: &str,
    ) -> Result<SyncOutcome, InboxError> {
        let request = InboxSyncRequest {
            application: self.settings.application_code.clone(),
            user_id: self.settings.user_id.clone(),
            hwid: self.settings.hwid.clone(),
            last_request_code: cursor.to_string(),
            count: Some(self.settings.page_size),
            last_request_time,
        };

        let response = match self.api.get_inbox_messages(request).await {
            Ok(response) => response,
            Err(error) => {
                let error = InboxError::from(error);
                self.report(&error).await;
                return Err(error);
            }
        };

        let now = Utc::now();
        let inbox = self.store.inbox();
        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut messages = Vec::with_capacity(response.messages.len());

        for remote in response.messages {
            let mut message = InboxMessage::from(remote);
            let outcome = inbox.merge(&message, now).await?;
            match outcome {
                MergeOutcome::Inserted => added.push(message.id.clone()),
                MergeOutcome::Advanced { .. } => updated.push(message.id.clone()),
                MergeOutcome::Unchanged(status) if status > message.status => {
                    debug!(id = %message.id, stored = %status, incoming = %message.status, "kept newer local status");
                }
                MergeOutcome::Unchanged(_) => {}
            }
            message.status = outcome.status_after(message.status);
            messages.push(message);
        }

        let mut deleted = Vec::new();
        for id in response.deleted {
            if inbox.delete(&id).await? {
                deleted.push(id);
            }
        }

        info!(
            received = messages.len(),
            added = added.len(),
            updated = updated.len(),
            deleted = deleted.len(),
            "inbox page synced"
        );
        self.publish_update(added, updated, deleted.clone());

        Ok(SyncOutcome {
            messages,
            next_cursor: response.next,
            deleted,
            new_count: response.new_inbox,
        })
    }

    /// Sync from the stored cursor and remember the cursor the service returns.
    pub async fn sync_next(&self) -> Result<SyncOutcome, InboxError> {
        let _guard = self.sync_lock.lock().await;
        let kv = self.store.key_value();
        let cursor: String = kv.get(KEY_LAST_REQUEST_CODE).await?.unwrap_or_default();
        let last_request_time: i64 = kv.get(KEY_LAST_REQUEST_TIME).await?.unwrap_or_default();
        let requested_at = Utc::now().timestamp();

        let outcome = self.sync(last_request_time, &cursor).await?;

        kv.set(KEY_LAST_REQUEST_CODE, &outcome.next_cursor).await?;
        kv.set(KEY_LAST_REQUEST_TIME, &requested_at).await?;
        Ok(outcome)
    }

    /// Returns the ids that moved to `read`.
    pub async fn mark_read(&self, ids: &[String]) -> Result<Vec<String>, InboxError> {
        let changed = self.transition(ids, InboxStatus::Read).await?;
        self.publish_update(Vec::new(), changed.clone(), Vec::new());
        self.report_status(&changed, InboxStatus::Read).await;
        Ok(changed)
    }

    /// Returns whether the message moved to `open`.
    pub async fn mark_opened(&self, id: &str) -> Result<bool, InboxError> {
        let changed = self.transition(&[id.to_string()], InboxStatus::Open).await?;
        self.publish_update(Vec::new(), changed.clone(), Vec::new());
        self.report_status(&changed, InboxStatus::Open).await;
        Ok(!changed.is_empty())
    }

    /// Mark messages deleted. They leave `messages()` at once and are purged
    /// after the retention window.
    pub async fn delete(&self, ids: &[String]) -> Result<Vec<String>, InboxError> {
        let changed = self.transition(ids, InboxStatus::Deleted).await?;
        self.publish_update(Vec::new(), Vec::new(), changed.clone());
        self.report_status(&changed, InboxStatus::Deleted).await;
        Ok(changed)
    }

    pub async fn unread_messages_count(&self) -> Result<u64, InboxError> {
        let filter = InboxFilter {
            status: Some(InboxStatus::Delivered),
            ..InboxFilter::visible(Utc::now())
        };
        Ok(self.store.inbox().count(&filter).await?)
    }

    /// Visible messages neither opened nor deleted.
    pub async fn messages_with_no_action_performed_count(&self) -> Result<u64, InboxError> {
        let filter = InboxFilter {
            status_below: Some(InboxStatus::Open),
            ..InboxFilter::visible(Utc::now())
        };
        Ok(self.store.inbox().count(&filter).await?)
    }

    /// Visible messages, newest first.
    pub async fn messages(&self) -> Result<Vec<InboxMessage>, InboxError> {
        Ok(self
            .store
            .inbox()
            .get_all(&InboxFilter::visible(Utc::now()))
            .await?)
    }

    pub async fn message(&self, id: &str) -> Result<Option<InboxMessage>, InboxError> {
        Ok(self.store.inbox().get(id).await?)
    }

    /// Store a message delivered with a push and announce it.
    ///
    /// A message already known keeps the greater of the two statuses and is not
    /// announced again.
    pub async fn receive_from_push(
        &self,
        mut message: InboxMessage,
    ) -> Result<InboxMessage, InboxError> {
        let outcome = self.store.inbox().merge(&message, Utc::now()).await?;
        message.status = outcome.status_after(message.status);
        if outcome == MergeOutcome::Inserted {
            debug!(id = %message.id, "inbox message received with push");
            self.publish(EventPayload::ReceiveInboxMessage {
                message: message.clone(),
            });
        }
        Ok(message)
    }

    /// Physically remove deleted messages older than the retention window and
    /// every message past its removal time.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, InboxError> {
        let inbox = self.store.inbox();
        let deleted = inbox
            .purge(&InboxFilter {
                deleted_before: Some(now - self.settings.retention),
                ..InboxFilter::default()
            })
            .await?;
        let expired = inbox
            .purge(&InboxFilter {
                removal_before: Some(now),
                ..InboxFilter::default()
            })
            .await?;
        if deleted + expired > 0 {
            info!(deleted, expired, "purged inbox messages");
        }
        Ok(deleted + expired)
    }

    async fn transition(
        &self,
        ids: &[String],
        status: InboxStatus,
    ) -> Result<Vec<String>, InboxError> {
        let now = Utc::now();
        let inbox = self.store.inbox();
        let mut changed = Vec::new();
        for id in ids {
            let Some(stored) = inbox.get(id).await? else {
                debug!(%id, "status change for unknown inbox message ignored");
                continue;
            };
            if stored.status >= status {
                continue;
            }
            if inbox.set_status(id, status, now).await? {
                changed.push(id.clone());
            }
        }
        Ok(changed)
    }

    /// Best-effort; a failure is reported and never retried.
    async fn report_status(&self, ids: &[String], status: InboxStatus) {
        let time = Utc::now().timestamp();
        for id in ids {
            let request = InboxStatusRequest {
                user_id: self.settings.user_id.clone(),
                hwid: self.settings.hwid.clone(),
                application: self.settings.application_code.clone(),
                inbox_code: id.clone(),
                time,
                status: status.code(),
                device_type: self.settings.device_type,
            };
            if let Err(error) = self.api.inbox_status(request).await {
                warn!(%id, status = %status, "inbox status report failed");
                self.report(&error.into()).await;
            }
        }
    }

    fn publish_update(&self, added: Vec<String>, updated: Vec<String>, deleted: Vec<String>) {
        if added.is_empty() && updated.is_empty() && deleted.is_empty() {
            return;
        }
        self.publish(EventPayload::UpdateInboxMessages {
            added,
            updated,
            deleted,
        });
    }

    fn publish(&self, payload: EventPayload) {
        self.bus
            .publish(Event::new(EventSource::System(COMPONENT.into()), payload));
    }

    async fn report(&self, error: &InboxError) {
        warn!(error = %error, "inbox operation failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::config::load_config_from_str;
    use beacon_core::event::{BroadcastEventBus, EventSubscription};
    use beacon_core::inbox::InboxAction;
    use beacon_storage::{NativeDatabase, open_store};
    use beacon_test_support::fakes::FakePushApi;
    use beacon_test_support::fixtures;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    struct Harness {
        _dir: TempDir,
        store: Arc<Store<NativeDatabase>>,
        bus: Arc<BroadcastEventBus>,
        api: Arc<FakePushApi>,
        manager: InboxManager<NativeDatabase>,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir.path().join("beacon.db")).await.unwrap());
        let bus = Arc::new(BroadcastEventBus::default());
        let api = Arc::new(FakePushApi::new());
        let config = load_config_from_str(&fixtures::config("full-config.toml")).unwrap();
        let manager = InboxManager::new(
            store.clone(),
            bus.clone(),
            api.clone(),
            InboxSettings::from_config(&config, "hw-1", 11),
        );
        Harness {
            _dir: dir,
            store,
            bus,
            api,
            manager,
        }
    }

    fn local_message(id: &str, order: i64) -> InboxMessage {
        InboxMessage {
            id: id.to_string(),
            order,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            removal_at: None,
            title: None,
            body: format!("body {id}"),
            image: None,
            action: InboxAction::None,
            status: InboxStatus::Delivered,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    async fn next_event(subscription: &mut EventSubscription) -> EventPayload {
        timeout(StdDuration::from_millis(200), subscription.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn first_sync_populates_unread_count() {
        let h = harness().await;
        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));

        let outcome = h.manager.sync(0, "").await.unwrap();

        assert_eq!(outcome.next_cursor, "c2");
        assert_eq!(outcome.new_count, 1);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(h.manager.unread_messages_count().await.unwrap(), 1);
        assert_eq!(
            h.manager.messages_with_no_action_performed_count().await.unwrap(),
            1
        );

        let requests = h.api.sync_requests();
        assert_eq!(requests[0].last_request_code, "");
        assert_eq!(requests[0].last_request_time, 0);
        assert_eq!(requests[0].count, Some(20));
        assert_eq!(requests[0].user_id, "user-1");
        assert_eq!(requests[0].hwid, "hw-1");
    }

    #[tokio::test]
    async fn stale_sync_never_downgrades_read() {
        let h = harness().await;
        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));
        h.manager.sync(0, "").await.unwrap();
        h.manager.mark_read(&ids(&["m1"])).await.unwrap();

        h.api.queue_sync_response(fixtures::sync_response("stale-page.json"));
        let outcome = h.manager.sync(0, "c2").await.unwrap();

        let m1 = outcome.messages.iter().find(|m| m.id == "m1").unwrap();
        assert_eq!(m1.status, InboxStatus::Read);
        assert_eq!(
            h.manager.message("m1").await.unwrap().unwrap().status,
            InboxStatus::Read
        );
        assert_eq!(h.manager.unread_messages_count().await.unwrap(), 1);
        assert_eq!(
            h.manager.messages_with_no_action_performed_count().await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn sync_publishes_added_and_confirmed_deletions() {
        let h = harness().await;
        h.manager
            .receive_from_push(local_message("gone", 1))
            .await
            .unwrap();
        let mut events = h.bus.listen("update-inbox-messages").unwrap();

        let mut page = fixtures::sync_response("stale-page.json");
        page.deleted = ids(&["gone", "never-seen"]);
        h.api.queue_sync_response(page);
        let outcome = h.manager.sync(0, "").await.unwrap();

        assert_eq!(outcome.deleted, ids(&["gone"]));
        assert!(h.manager.message("gone").await.unwrap().is_none());
        assert_matches!(
            next_event(&mut events).await,
            EventPayload::UpdateInboxMessages { added, updated, deleted }
                if added == ids(&["m1", "m2"]) && updated.is_empty() && deleted == ids(&["gone"])
        );
    }

    #[tokio::test]
    async fn empty_page_publishes_nothing() {
        let h = harness().await;
        let mut events = h.bus.listen("*").unwrap();

        let outcome = h.manager.sync(0, "").await.unwrap();

        assert!(outcome.messages.is_empty());
        assert!(
            timeout(StdDuration::from_millis(50), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn sync_failure_is_reported_and_returned() {
        let h = harness().await;
        h.api
            .queue_sync_error(ApiError::Network("offline".to_string()));
        let mut events = h.bus.listen("error").unwrap();

        assert_matches!(h.manager.sync(0, "").await, Err(InboxError::Network(_)));
        assert_matches!(
            next_event(&mut events).await,
            EventPayload::Error { component, .. } if component == "inbox"
        );
        let diagnostics = h.store.diagnostic_log().get_all(None).await.unwrap();
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn sync_next_forwards_and_stores_cursor() {
        let h = harness().await;
        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));
        h.api.queue_sync_response(fixtures::sync_response("stale-page.json"));

        h.manager.sync_next().await.unwrap();
        h.manager.sync_next().await.unwrap();

        let requests = h.api.sync_requests();
        assert_eq!(requests[0].last_request_code, "");
        assert_eq!(requests[0].last_request_time, 0);
        assert_eq!(requests[1].last_request_code, "c2");
        assert!(requests[1].last_request_time > 0);

        let cursor: Option<String> = h.store.key_value().get(KEY_LAST_REQUEST_CODE).await.unwrap();
        assert_eq!(cursor.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn failed_sync_next_keeps_cursor() {
        let h = harness().await;
        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));
        h.manager.sync_next().await.unwrap();

        h.api.queue_sync_error(ApiError::Decode("bad json".to_string()));
        assert!(h.manager.sync_next().await.is_err());

        let cursor: Option<String> = h.store.key_value().get(KEY_LAST_REQUEST_CODE).await.unwrap();
        assert_eq!(cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn mark_read_is_local_first_and_reports() {
        let h = harness().await;
        for (id, order) in [("a", 1), ("b", 2)] {
            h.manager.receive_from_push(local_message(id, order)).await.unwrap();
        }
        let mut events = h.bus.listen("update-inbox-messages").unwrap();

        let changed = h.manager.mark_read(&ids(&["a", "missing"])).await.unwrap();

        assert_eq!(changed, ids(&["a"]));
        assert_eq!(h.manager.unread_messages_count().await.unwrap(), 1);
        assert_matches!(
            next_event(&mut events).await,
            EventPayload::UpdateInboxMessages { updated, .. } if updated == ids(&["a"])
        );

        let reports = h.api.status_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].inbox_code, "a");
        assert_eq!(reports[0].status, 2);
        assert_eq!(reports[0].device_type, 11);
    }

    #[tokio::test]
    async fn repeated_mark_read_changes_nothing() {
        let h = harness().await;
        h.manager.receive_from_push(local_message("a", 1)).await.unwrap();
        h.manager.mark_opened("a").await.unwrap();

        let changed = h.manager.mark_read(&ids(&["a"])).await.unwrap();

        assert!(changed.is_empty());
        assert_eq!(
            h.manager.message("a").await.unwrap().unwrap().status,
            InboxStatus::Open
        );
        assert_eq!(h.api.status_reports().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_status_report_keeps_local_transition() {
        let h = harness().await;
        h.manager.receive_from_push(local_message("a", 1)).await.unwrap();
        h.api
            .fail_status_reports(Some(ApiError::Network("timeout".to_string())));

        assert!(h.manager.mark_opened("a").await.unwrap());

        assert_eq!(
            h.manager.message("a").await.unwrap().unwrap().status,
            InboxStatus::Open
        );
        assert_eq!(
            h.manager.messages_with_no_action_performed_count().await.unwrap(),
            0
        );
        assert!(logs_contain("inbox status report failed"));

        h.api.fail_status_reports(None);
        h.manager.mark_read(&ids(&["a"])).await.unwrap();
        assert_eq!(h.api.status_reports().len(), 1);
    }

    #[tokio::test]
    async fn deleted_messages_leave_the_listing_then_get_purged() {
        let h = harness().await;
        for (id, order) in [("a", 1), ("b", 2), ("c", 3)] {
            h.manager.receive_from_push(local_message(id, order)).await.unwrap();
        }

        let deleted = h.manager.delete(&ids(&["b"])).await.unwrap();
        assert_eq!(deleted, ids(&["b"]));

        let listed: Vec<String> = h
            .manager
            .messages()
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(listed, ids(&["c", "a"]));

        assert_eq!(h.manager.purge_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::days(4);
        assert_eq!(h.manager.purge_expired(later).await.unwrap(), 1);
        assert!(h.manager.message("b").await.unwrap().is_none());
        assert!(h.manager.message("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleted_message_is_not_revived_by_sync() {
        let h = harness().await;
        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));
        h.manager.sync(0, "").await.unwrap();
        h.manager.delete(&ids(&["m1"])).await.unwrap();

        h.api.queue_sync_response(fixtures::sync_response("first-page.json"));
        h.manager.sync(0, "").await.unwrap();

        assert_eq!(
            h.manager.message("m1").await.unwrap().unwrap().status,
            InboxStatus::Deleted
        );
        assert!(h.manager.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_messages_are_hidden_and_purged() {
        let h = harness().await;
        let now = Utc::now();
        let mut expiring = local_message("soon", 1);
        expiring.removal_at = Some(now + Duration::minutes(5));
        h.manager.receive_from_push(expiring).await.unwrap();

        assert_eq!(h.manager.unread_messages_count().await.unwrap(), 1);
        assert_eq!(
            h.manager
                .purge_expired(now + Duration::minutes(10))
                .await
                .unwrap(),
            1
        );
        assert_eq!(h.manager.unread_messages_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn push_delivered_message_is_announced_once() {
        let h = harness().await;
        let mut events = h.bus.listen("receive-inbox-message").unwrap();

        h.manager.receive_from_push(local_message("p1", 5)).await.unwrap();
        h.manager.mark_read(&ids(&["p1"])).await.unwrap();
        let again = h.manager.receive_from_push(local_message("p1", 5)).await.unwrap();

        assert_eq!(again.status, InboxStatus::Read);
        assert_matches!(
            next_event(&mut events).await,
            EventPayload::ReceiveInboxMessage { message } if message.id == "p1"
        );
        assert!(
            timeout(StdDuration::from_millis(50), events.recv())
                .await
                .is_err()
        );
    }

    #[test]
    fn settings_fall_back_to_device_id_for_user() {
        let config = load_config_from_str(&fixtures::config("minimal-config.toml")).unwrap();
        let settings = InboxSettings::from_config(&config, "hw-9", 10);
        if config.application.user_id.is_none() {
            assert_eq!(settings.user_id, "hw-9");
        }
        assert_eq!(settings.page_size, config.inbox.page_size);
        assert_eq!(settings.retention, Duration::days(7));
    }
}
