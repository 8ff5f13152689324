//! In-memory collaborators that count every call made to them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use beacon_core::api::{
    ApiError, DeviceRequest, InboxStatusRequest, InboxSyncRequest, InboxSyncResponse, PushApi,
    PushStatRequest, RegisterDeviceRequest,
};
use beacon_core::event::PermissionState;
use beacon_push::{BackendError, DriverParams, NativeSubscription, PushBackend};
use futures::future::BoxFuture;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BackendState {
    permission: PermissionState,
    prompt_answer: PermissionState,
    subscription: Option<NativeSubscription>,
    initialize_failure: Option<String>,
    subscribe_failure: Option<String>,
    subscribe_delay: Duration,
    issued: usize,
}

/// A [`PushBackend`] with scripted answers.
///
/// Starts with permission `default`, grants on prompt and issues tokens
/// `token-1`, `token-2`, ...
pub struct FakePushBackend {
    state: Mutex<BackendState>,
    initialize_calls: AtomicUsize,
    permission_calls: AtomicUsize,
    prompt_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    last_params: Mutex<Option<DriverParams>>,
}

impl Default for FakePushBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePushBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                permission: PermissionState::Default,
                prompt_answer: PermissionState::Granted,
                subscription: None,
                initialize_failure: None,
                subscribe_failure: None,
                subscribe_delay: Duration::ZERO,
                issued: 0,
            }),
            initialize_calls: AtomicUsize::new(0),
            permission_calls: AtomicUsize::new(0),
            prompt_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    pub fn with_permission(self, permission: PermissionState) -> Self {
        self.set_permission(permission);
        self
    }

    pub fn with_prompt_answer(self, answer: PermissionState) -> Self {
        lock(&self.state).prompt_answer = answer;
        self
    }

    pub fn with_subscribe_delay(self, delay: Duration) -> Self {
        lock(&self.state).subscribe_delay = delay;
        self
    }

    pub fn failing_initialize(self, reason: &str) -> Self {
        self.set_initialize_failure(Some(reason));
        self
    }

    pub fn failing_subscribe(self, reason: &str) -> Self {
        lock(&self.state).subscribe_failure = Some(reason.to_string());
        self
    }

    /// Simulate the user changing permission in browser settings.
    pub fn set_permission(&self, permission: PermissionState) {
        let mut state = lock(&self.state);
        state.permission = permission;
        if permission != PermissionState::Granted {
            state.subscription = None;
        }
    }

    pub fn set_initialize_failure(&self, reason: Option<&str>) {
        lock(&self.state).initialize_failure = reason.map(str::to_string);
    }

    pub fn set_subscribe_failure(&self, reason: Option<&str>) {
        lock(&self.state).subscribe_failure = reason.map(str::to_string);
    }

    /// Simulate the browser dropping the subscription (site data cleared).
    pub fn lose_subscription(&self) {
        lock(&self.state).subscription = None;
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn permission_calls(&self) -> usize {
        self.permission_calls.load(Ordering::SeqCst)
    }

    pub fn prompt_calls(&self) -> usize {
        self.prompt_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Every native call of any kind.
    pub fn total_calls(&self) -> usize {
        self.initialize_calls()
            + self.permission_calls()
            + self.prompt_calls()
            + self.subscribe_calls()
            + self.unsubscribe_calls()
    }

    pub fn last_params(&self) -> Option<DriverParams> {
        lock(&self.last_params).clone()
    }

    pub fn current_token(&self) -> Option<String> {
        lock(&self.state)
            .subscription
            .as_ref()
            .map(|subscription| subscription.token.clone())
    }
}

impl PushBackend for FakePushBackend {
    fn initialize(&self, params: &DriverParams) -> BoxFuture<'_, Result<(), BackendError>> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_params) = Some(params.clone());
        let failure = lock(&self.state).initialize_failure.clone();
        Box::pin(async move {
            match failure {
                Some(reason) => Err(BackendError::Failed(reason)),
                None => Ok(()),
            }
        })
    }

    fn permission_state(&self) -> BoxFuture<'_, Result<PermissionState, BackendError>> {
        self.permission_calls.fetch_add(1, Ordering::SeqCst);
        let permission = lock(&self.state).permission;
        Box::pin(async move { Ok(permission) })
    }

    fn request_permission(
        &self,
        _params: &DriverParams,
    ) -> BoxFuture<'_, Result<PermissionState, BackendError>> {
        self.prompt_calls.fetch_add(1, Ordering::SeqCst);
        let answer = {
            let mut state = lock(&self.state);
            state.permission = state.prompt_answer;
            state.permission
        };
        Box::pin(async move { Ok(answer) })
    }

    fn subscribe(
        &self,
        _params: &DriverParams,
    ) -> BoxFuture<'_, Result<NativeSubscription, BackendError>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let delay = lock(&self.state).subscribe_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = lock(&self.state);
            if let Some(reason) = &state.subscribe_failure {
                return Err(BackendError::Failed(reason.clone()));
            }
            if state.permission != PermissionState::Granted {
                return Err(BackendError::PermissionDenied);
            }
            state.issued += 1;
            let subscription = NativeSubscription {
                token: format!("token-{}", state.issued),
                public_key: Some(format!("p256dh-{}", state.issued)),
                auth_token: Some(format!("auth-{}", state.issued)),
            };
            state.subscription = Some(subscription.clone());
            Ok(subscription)
        })
    }

    fn current_subscription(
        &self,
    ) -> BoxFuture<'_, Result<Option<NativeSubscription>, BackendError>> {
        let subscription = lock(&self.state).subscription.clone();
        Box::pin(async move { Ok(subscription) })
    }

    fn unsubscribe(&self) -> BoxFuture<'_, Result<bool, BackendError>> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let existed = lock(&self.state).subscription.take().is_some();
        Box::pin(async move { Ok(existed) })
    }
}

/// A [`PushApi`] that records requests and replays queued sync responses.
#[derive(Default)]
pub struct FakePushApi {
    registered: Mutex<Vec<RegisterDeviceRequest>>,
    unregistered: Mutex<Vec<DeviceRequest>>,
    sync_requests: Mutex<Vec<InboxSyncRequest>>,
    status_reports: Mutex<Vec<InboxStatusRequest>>,
    delivery_events: Mutex<Vec<PushStatRequest>>,
    push_stats: Mutex<Vec<PushStatRequest>>,
    sync_responses: Mutex<VecDeque<Result<InboxSyncResponse, ApiError>>>,
    register_failure: Mutex<Option<ApiError>>,
    status_failure: Mutex<Option<ApiError>>,
}

impl FakePushApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Served by the next `getInboxMessages`; an empty page once the queue runs dry.
    pub fn queue_sync_response(&self, response: InboxSyncResponse) {
        lock(&self.sync_responses).push_back(Ok(response));
    }

    pub fn queue_sync_error(&self, error: ApiError) {
        lock(&self.sync_responses).push_back(Err(error));
    }

    pub fn fail_register(&self, error: Option<ApiError>) {
        *lock(&self.register_failure) = error;
    }

    pub fn fail_status_reports(&self, error: Option<ApiError>) {
        *lock(&self.status_failure) = error;
    }

    pub fn registered(&self) -> Vec<RegisterDeviceRequest> {
        lock(&self.registered).clone()
    }

    pub fn unregistered(&self) -> Vec<DeviceRequest> {
        lock(&self.unregistered).clone()
    }

    pub fn sync_requests(&self) -> Vec<InboxSyncRequest> {
        lock(&self.sync_requests).clone()
    }

    pub fn status_reports(&self) -> Vec<InboxStatusRequest> {
        lock(&self.status_reports).clone()
    }

    pub fn delivery_events(&self) -> Vec<PushStatRequest> {
        lock(&self.delivery_events).clone()
    }

    pub fn push_stats(&self) -> Vec<PushStatRequest> {
        lock(&self.push_stats).clone()
    }
}

impl PushApi for FakePushApi {
    fn register_device(&self, request: RegisterDeviceRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        let failure = lock(&self.register_failure).clone();
        lock(&self.registered).push(request);
        Box::pin(async move { failure.map_or(Ok(()), Err) })
    }

    fn unregister_device(&self, request: DeviceRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        lock(&self.unregistered).push(request);
        Box::pin(async { Ok(()) })
    }

    fn get_inbox_messages(
        &self,
        request: InboxSyncRequest,
    ) -> BoxFuture<'_, Result<InboxSyncResponse, ApiError>> {
        lock(&self.sync_requests).push(request);
        let response = lock(&self.sync_responses)
            .pop_front()
            .unwrap_or_else(|| Ok(InboxSyncResponse::default()));
        Box::pin(async move { response })
    }

    fn inbox_status(&self, request: InboxStatusRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        let failure = lock(&self.status_failure).clone();
        lock(&self.status_reports).push(request);
        Box::pin(async move { failure.map_or(Ok(()), Err) })
    }

    fn message_delivery_event(
        &self,
        request: PushStatRequest,
    ) -> BoxFuture<'_, Result<(), ApiError>> {
        lock(&self.delivery_events).push(request);
        Box::pin(async { Ok(()) })
    }

    fn push_stat(&self, request: PushStatRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        lock(&self.push_stats).push(request);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backend_prompts_then_issues_sequential_tokens() {
        let backend = FakePushBackend::new();
        let params = DriverParams::Extension {
            sender_id: "1".to_string(),
        };

        assert_eq!(
            backend.request_permission(&params).await.unwrap(),
            PermissionState::Granted
        );
        assert_eq!(backend.subscribe(&params).await.unwrap().token, "token-1");
        assert_eq!(backend.subscribe(&params).await.unwrap().token, "token-2");
        assert_eq!(backend.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn api_replays_queued_responses_in_order() {
        let api = FakePushApi::new();
        api.queue_sync_error(ApiError::Network("offline".to_string()));

        let request = InboxSyncRequest {
            application: "ABCDE-12345".to_string(),
            user_id: "u".to_string(),
            hwid: "h".to_string(),
            last_request_code: String::new(),
            count: None,
            last_request_time: 0,
        };
        assert!(api.get_inbox_messages(request.clone()).await.is_err());
        assert!(api.get_inbox_messages(request).await.unwrap().messages.is_empty());
        assert_eq!(api.sync_requests().len(), 2);
    }
}
