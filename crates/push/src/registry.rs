use std::sync::Arc;

use beacon_core::config::Config;
use beacon_core::platform::{PlatformProfile, PushMechanism};
use tracing::debug;

use crate::PushError;
use crate::backend::PushBackend;
use crate::driver::{Driver, DriverParams};

/// Picks the single driver a profile's push mechanism calls for.
///
/// Selection never cascades: tokens from one backend are useless to another, so a
/// driver that later fails to initialize is reported, not replaced.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    params_by_mechanism: Vec<(PushMechanism, Result<DriverParams, String>)>,
}

impl DriverRegistry {
    pub fn from_config(config: &Config) -> Self {
        let worker = Ok(DriverParams::Worker {
            service_worker_url: config.worker.service_worker_url.clone(),
            scope: config.worker.scope.clone(),
            application_server_key: config.worker.application_server_key.clone(),
        });

        let safari = match (&config.safari.website_push_id, &config.safari.web_service_url) {
            (Some(website_push_id), Some(web_service_url)) => Ok(DriverParams::Safari {
                website_push_id: website_push_id.clone(),
                web_service_url: web_service_url.clone(),
                application_code: config.application.code.clone(),
            }),
            (None, _) => Err("safari.website_push_id is not configured".to_string()),
            (_, None) => Err("safari.web_service_url is not configured".to_string()),
        };

        let extension = config
            .extension
            .sender_id
            .clone()
            .map(|sender_id| DriverParams::Extension { sender_id })
            .ok_or_else(|| "extension.sender_id is not configured".to_string());

        Self {
            params_by_mechanism: vec![
                (PushMechanism::ServiceWorker, worker),
                (PushMechanism::SafariPush, safari),
                (PushMechanism::ExtensionGcm, extension),
            ],
        }
    }

    /// The driver for `profile`.
    ///
    /// Unsupported profiles are [`PushError::CapabilityUnavailable`]; a supported
    /// mechanism without its configuration is [`PushError::DriverInit`].
    pub fn select(
        &self,
        profile: &PlatformProfile,
        backend: Arc<dyn PushBackend>,
    ) -> Result<Driver, PushError> {
        if !profile.is_supported() {
            return Err(PushError::CapabilityUnavailable);
        }

        let params = self
            .params_by_mechanism
            .iter()
            .find(|(mechanism, _)| *mechanism == profile.mechanism)
            .map(|(_, params)| params.clone())
            .ok_or(PushError::CapabilityUnavailable)?
            .map_err(PushError::DriverInit)?;

        debug!(mechanism = ?profile.mechanism, driver = %params.kind(), "selected push driver");
        Ok(Driver::new(params, backend))
    }
}
