//! Host capability detection.
//!
//! [`detect`] classifies the host environment once at startup and reports which
//! native push mechanism is usable together with the provider code the remote
//! service expects as `device_type`. It never fails: an environment it cannot
//! place yields [`PlatformProfile::unsupported`].

use serde::{Deserialize, Serialize};

/// What the host exposes, as observed by the embedding layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEnvironment {
    pub user_agent: String,
    /// Apple's proprietary `window.safari.pushNotification` object is present
    pub has_safari_push: bool,
    pub has_service_worker: bool,
    pub has_push_manager: bool,
    pub has_notification_api: bool,
    /// Running inside a browser extension with the GCM API available
    pub has_extension_gcm: bool,
    pub has_promise: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BrowserFamily {
    Safari,
    Chrome,
    Firefox,
    /// Chromium-based Edge
    Edge,
    /// EdgeHTML Edge: advertises Push API support it does not deliver
    EdgeLegacy,
    Opera,
    Yandex,
    Samsung,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OsFamily {
    MacOs,
    Windows,
    Linux,
    ChromeOs,
    Android,
    Ios,
    Unknown,
}

impl OsFamily {
    pub fn is_desktop(self) -> bool {
        matches!(
            self,
            Self::MacOs | Self::Windows | Self::Linux | Self::ChromeOs
        )
    }
}

/// The native push backend a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushMechanism {
    /// Standards-based Web Push through a service worker
    ServiceWorker,
    /// Apple's proprietary Safari push
    SafariPush,
    /// GCM inside a Chrome extension
    ExtensionGcm,
    None,
}

/// Device type reported to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ProviderCode {
    Unsupported = 0,
    Safari = 10,
    Chrome = 11,
    Firefox = 12,
}

impl ProviderCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<ProviderCode> for u16 {
    fn from(code: ProviderCode) -> Self {
        code.code()
    }
}

impl TryFrom<u16> for ProviderCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unsupported),
            10 => Ok(Self::Safari),
            11 => Ok(Self::Chrome),
            12 => Ok(Self::Firefox),
            other => Err(format!("unknown provider code {other}")),
        }
    }
}

impl std::fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProfile {
    pub browser: BrowserFamily,
    pub os: OsFamily,
    pub mechanism: PushMechanism,
    pub provider_code: ProviderCode,
    pub can_use_service_worker: bool,
    pub can_use_native_push: bool,
    pub supports_promise: bool,
}

impl PlatformProfile {
    pub fn unsupported() -> Self {
        Self {
            browser: BrowserFamily::Unknown,
            os: OsFamily::Unknown,
            mechanism: PushMechanism::None,
            provider_code: ProviderCode::Unsupported,
            can_use_service_worker: false,
            can_use_native_push: false,
            supports_promise: false,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.mechanism != PushMechanism::None
    }
}

pub fn detect(environment: &HostEnvironment) -> PlatformProfile {
    let browser = detect_browser(environment);
    let os = detect_os(&environment.user_agent);

    let can_use_service_worker = environment.has_service_worker && environment.has_push_manager;
    let safari_push_usable = environment.has_safari_push && os.is_desktop();
    let standard_push_usable = can_use_service_worker && browser != BrowserFamily::EdgeLegacy;
    let can_use_native_push = safari_push_usable || standard_push_usable;

    let mechanism = if environment.has_extension_gcm && is_chromium(browser) {
        PushMechanism::ExtensionGcm
    } else if safari_push_usable {
        PushMechanism::SafariPush
    } else if standard_push_usable {
        PushMechanism::ServiceWorker
    } else {
        PushMechanism::None
    };

    if mechanism == PushMechanism::None {
        return PlatformProfile {
            browser,
            os,
            supports_promise: environment.has_promise,
            can_use_service_worker,
            ..PlatformProfile::unsupported()
        };
    }

    let provider_code = match mechanism {
        PushMechanism::SafariPush => ProviderCode::Safari,
        PushMechanism::ServiceWorker if browser == BrowserFamily::Firefox => ProviderCode::Firefox,
        PushMechanism::ServiceWorker | PushMechanism::ExtensionGcm => ProviderCode::Chrome,
        PushMechanism::None => ProviderCode::Unsupported,
    };

    PlatformProfile {
        browser,
        os,
        mechanism,
        provider_code,
        can_use_service_worker,
        can_use_native_push: can_use_native_push || mechanism == PushMechanism::ExtensionGcm,
        supports_promise: environment.has_promise,
    }
}

fn is_chromium(browser: BrowserFamily) -> bool {
    matches!(
        browser,
        BrowserFamily::Chrome
            | BrowserFamily::Edge
            | BrowserFamily::Opera
            | BrowserFamily::Yandex
            | BrowserFamily::Samsung
    )
}

// Order matters: Chromium derivatives also carry "Chrome/" and "Safari/", so the
// more specific tokens are checked first. The proprietary push object wins over
// any user-agent token.
fn detect_browser(environment: &HostEnvironment) -> BrowserFamily {
    if environment.has_safari_push {
        return BrowserFamily::Safari;
    }

    let ua = environment.user_agent.as_str();
    if ua.contains("Edge/") {
        BrowserFamily::EdgeLegacy
    } else if ua.contains("Edg/") || ua.contains("EdgA/") {
        BrowserFamily::Edge
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        BrowserFamily::Opera
    } else if ua.contains("YaBrowser/") {
        BrowserFamily::Yandex
    } else if ua.contains("SamsungBrowser/") {
        BrowserFamily::Samsung
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        BrowserFamily::Firefox
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") || ua.contains("Chromium/") {
        BrowserFamily::Chrome
    } else if ua.contains("Safari/") {
        BrowserFamily::Safari
    } else {
        BrowserFamily::Unknown
    }
}

fn detect_os(user_agent: &str) -> OsFamily {
    if user_agent.contains("Windows") {
        OsFamily::Windows
    } else if user_agent.contains("Android") {
        OsFamily::Android
    } else if user_agent.contains("iPhone")
        || user_agent.contains("iPad")
        || user_agent.contains("iPod")
    {
        OsFamily::Ios
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        OsFamily::MacOs
    } else if user_agent.contains("CrOS") {
        OsFamily::ChromeOs
    } else if user_agent.contains("Linux") {
        OsFamily::Linux
    } else {
        OsFamily::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15";
    const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const EDGE_LEGACY: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/70.0.3538.102 Safari/537.36 Edge/18.19041";
    const EDGE_CHROMIUM: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
    const OPERA_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36 OPR/105.0.0.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1";

    fn service_worker_env(user_agent: &str) -> HostEnvironment {
        HostEnvironment {
            user_agent: user_agent.to_string(),
            has_service_worker: true,
            has_push_manager: true,
            has_notification_api: true,
            has_promise: true,
            ..Default::default()
        }
    }

    #[test]
    fn safari_push_object_on_desktop_selects_safari() {
        let environment = HostEnvironment {
            user_agent: SAFARI_MAC.to_string(),
            has_safari_push: true,
            has_notification_api: true,
            has_promise: true,
            ..Default::default()
        };
        let profile = detect(&environment);
        assert_eq!(profile.browser, BrowserFamily::Safari);
        assert_eq!(profile.os, OsFamily::MacOs);
        assert_eq!(profile.mechanism, PushMechanism::SafariPush);
        assert_eq!(profile.provider_code, ProviderCode::Safari);
        assert!(profile.can_use_native_push);
    }

    #[test]
    fn safari_push_object_wins_over_spoofed_user_agent() {
        let environment = HostEnvironment {
            user_agent: CHROME_WIN.replace("Windows NT 10.0", "Macintosh; Intel Mac OS X 10_15"),
            has_safari_push: true,
            ..Default::default()
        };
        let profile = detect(&environment);
        assert_eq!(profile.browser, BrowserFamily::Safari);
        assert_eq!(profile.provider_code, ProviderCode::Safari);
    }

    #[test]
    fn safari_push_object_on_mobile_is_not_usable() {
        let environment = HostEnvironment {
            user_agent: SAFARI_IPHONE.to_string(),
            has_safari_push: true,
            ..Default::default()
        };
        let profile = detect(&environment);
        assert_eq!(profile.os, OsFamily::Ios);
        assert!(!profile.can_use_native_push);
        assert_eq!(profile.provider_code, ProviderCode::Unsupported);
    }

    #[test]
    fn chrome_with_service_worker_selects_worker() {
        let profile = detect(&service_worker_env(CHROME_WIN));
        assert_eq!(profile.browser, BrowserFamily::Chrome);
        assert_eq!(profile.os, OsFamily::Windows);
        assert_eq!(profile.mechanism, PushMechanism::ServiceWorker);
        assert_eq!(profile.provider_code, ProviderCode::Chrome);
        assert!(profile.can_use_service_worker);
        assert!(profile.can_use_native_push);
        assert!(profile.supports_promise);
    }

    #[test]
    fn firefox_gets_its_own_provider_code() {
        let profile = detect(&service_worker_env(FIREFOX_LINUX));
        assert_eq!(profile.browser, BrowserFamily::Firefox);
        assert_eq!(profile.os, OsFamily::Linux);
        assert_eq!(profile.provider_code, ProviderCode::Firefox);
    }

    #[test]
    fn legacy_edge_is_excluded_despite_push_manager() {
        let profile = detect(&service_worker_env(EDGE_LEGACY));
        assert_eq!(profile.browser, BrowserFamily::EdgeLegacy);
        assert!(profile.can_use_service_worker);
        assert!(!profile.can_use_native_push);
        assert_eq!(profile.mechanism, PushMechanism::None);
    }

    #[test]
    fn chromium_derivatives_are_classified_before_chrome() {
        assert_eq!(detect(&service_worker_env(EDGE_CHROMIUM)).browser, BrowserFamily::Edge);
        assert_eq!(detect(&service_worker_env(OPERA_MAC)).browser, BrowserFamily::Opera);
        assert_eq!(
            detect(&service_worker_env(OPERA_MAC)).provider_code,
            ProviderCode::Chrome
        );
    }

    #[test]
    fn extension_context_selects_gcm() {
        let environment = HostEnvironment {
            user_agent: CHROME_WIN.to_string(),
            has_extension_gcm: true,
            ..Default::default()
        };
        let profile = detect(&environment);
        assert_eq!(profile.mechanism, PushMechanism::ExtensionGcm);
        assert_eq!(profile.provider_code, ProviderCode::Chrome);
        assert!(profile.can_use_native_push);
    }

    #[test]
    fn empty_environment_degrades_to_unsupported() {
        let profile = detect(&HostEnvironment::default());
        assert_eq!(profile, PlatformProfile::unsupported());
        assert!(!profile.is_supported());
    }

    #[test]
    fn provider_code_round_trips_through_integer() {
        assert_eq!(serde_json::to_string(&ProviderCode::Firefox).unwrap(), "12");
        assert_eq!(ProviderCode::try_from(10), Ok(ProviderCode::Safari));
        assert!(ProviderCode::try_from(99).is_err());
    }
}
