pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use beacon_core::api::InboxSyncResponse;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    pub fn sync_response(name: &str) -> InboxSyncResponse {
        let json = read_or_panic(Path::new("sync").join(name));
        serde_json::from_str(&json)
            .unwrap_or_else(|error| panic!("sync fixture {name} is not a sync response: {error}"))
    }

    pub fn push_payload(name: &str) -> serde_json::Value {
        let json = read_or_panic(Path::new("payloads").join(name));
        serde_json::from_str(&json)
            .unwrap_or_else(|error| panic!("payload fixture {name} is not json: {error}"))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod fakes;

/// Host environments as a browser bridge would report them.
pub mod hosts {
    use beacon_core::platform::HostEnvironment;

    pub const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    pub const SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15";

    pub fn chrome() -> HostEnvironment {
        HostEnvironment {
            user_agent: CHROME_WINDOWS.to_string(),
            has_service_worker: true,
            has_push_manager: true,
            has_notification_api: true,
            has_promise: true,
            ..HostEnvironment::default()
        }
    }

    pub fn safari() -> HostEnvironment {
        HostEnvironment {
            user_agent: SAFARI_MAC.to_string(),
            has_safari_push: true,
            has_notification_api: true,
            has_promise: true,
            ..HostEnvironment::default()
        }
    }

    pub fn chrome_extension() -> HostEnvironment {
        HostEnvironment {
            has_extension_gcm: true,
            ..chrome()
        }
    }

    pub fn unsupported() -> HostEnvironment {
        HostEnvironment {
            user_agent: "curl/8.4.0".to_string(),
            ..HostEnvironment::default()
        }
    }
}
