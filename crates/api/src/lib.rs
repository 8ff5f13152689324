//! HTTP client for the remote push service.
//!
//! Every method is a `POST {endpoint}{method}` with the body wrapped as
//! `{"request": {...}}`. Responses carry an envelope:
//!
//! ```json
//! {"status_code": 200, "status_message": "OK", "response": {...}}
//! ```
//!
//! A non-200 envelope status is an error even when the HTTP status is 200.

use std::time::Duration;

use beacon_core::api::{
    ApiError, DeviceRequest, InboxStatusRequest, InboxSyncRequest, InboxSyncResponse, PushApi,
    PushStatRequest, RegisterDeviceRequest,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("beacon/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct RequestEnvelope<'a, T> {
    request: &'a T,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    status_code: u16,
    #[serde(default)]
    status_message: String,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

/// [`PushApi`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpPushApi {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPushApi {
    pub fn new(endpoint: &str) -> Result<Self, ApiError> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| ApiError::Network(format!("failed to build HTTP client: {error}")))?;

        let mut endpoint = endpoint.to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }

        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: Serialize>(
        &self,
        method: &str,
        request: &T,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let url = format!("{}{method}", self.endpoint);
        debug!(%method, "calling remote push service");

        let response = self
            .http
            .post(&url)
            .json(&RequestEnvelope { request })
            .send()
            .await
            .map_err(|error| {
                warn!(%method, error = %error, "push service request failed");
                ApiError::Network(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%method, status = %status, "push service returned HTTP error");
            return Err(ApiError::Status {
                code: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|error| ApiError::Decode(error.to_string()))?;

        if envelope.status_code != 200 {
            warn!(
                %method,
                status_code = envelope.status_code,
                status_message = %envelope.status_message,
                "push service rejected request"
            );
            return Err(ApiError::Status {
                code: envelope.status_code,
                message: envelope.status_message,
            });
        }

        Ok(envelope.response)
    }

    async fn call_for<T: Serialize, R: DeserializeOwned + Default>(
        &self,
        method: &str,
        request: &T,
    ) -> Result<R, ApiError> {
        match self.call(method, request).await? {
            Some(serde_json::Value::Null) | None => Ok(R::default()),
            Some(body) => {
                serde_json::from_value(body).map_err(|error| ApiError::Decode(error.to_string()))
            }
        }
    }
}

impl PushApi for HttpPushApi {
    fn register_device(&self, request: RegisterDeviceRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move { self.call("registerDevice", &request).await.map(drop) })
    }

    fn unregister_device(&self, request: DeviceRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move { self.call("unregisterDevice", &request).await.map(drop) })
    }

    fn get_inbox_messages(
        &self,
        request: InboxSyncRequest,
    ) -> BoxFuture<'_, Result<InboxSyncResponse, ApiError>> {
        Box::pin(async move { self.call_for("getInboxMessages", &request).await })
    }

    fn inbox_status(&self, request: InboxStatusRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move { self.call("inboxStatus", &request).await.map(drop) })
    }

    fn message_delivery_event(
        &self,
        request: PushStatRequest,
    ) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move { self.call("messageDeliveryEvent", &request).await.map(drop) })
    }

    fn push_stat(&self, request: PushStatRequest) -> BoxFuture<'_, Result<(), ApiError>> {
        Box::pin(async move { self.call("pushStat", &request).await.map(drop) })
    }
}
