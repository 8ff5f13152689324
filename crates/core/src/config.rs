use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub safari: SafariConfig,
    #[serde(default)]
    pub extension: ExtensionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub code: String,
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            retention_days: default_retention_days(),
        }
    }
}

/// Standards-based Web Push parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_service_worker_url")]
    pub service_worker_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    pub application_server_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_worker_url: default_service_worker_url(),
            scope: default_scope(),
            application_server_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SafariConfig {
    pub website_push_id: Option<String>,
    pub web_service_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionConfig {
    pub sender_id: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    application_code: Option<String>,
    api_endpoint: Option<String>,
    user_id: Option<String>,
    log_level: Option<String>,
}

fn default_api_endpoint() -> String {
    "https://cp.pushbeacon.io/json/1.3/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_page_size() -> u32 {
    50
}

fn default_retention_days() -> u32 {
    7
}

fn default_service_worker_url() -> String {
    "/beacon-sw.js".to_string()
}

fn default_scope() -> String {
    "/".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_CONFIG_TOML: &str = r#"[application]
code = ""
# api_endpoint = "https://cp.pushbeacon.io/json/1.3/"
# user_id = "user-42"

[logging]
level = "info"

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/beacon/beacon.db"

[inbox]
page_size = 50
retention_days = 7

[worker]
service_worker_url = "/beacon-sw.js"
scope = "/"
# application_server_key = "BASE64URL_VAPID_PUBLIC_KEY"

[safari]
# website_push_id = "web.com.example"
# web_service_url = "https://cp.pushbeacon.io/json/1.3/safari"

[extension]
# sender_id = "123456789012"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "pushbeacon", "beacon") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Return the default on-disk location of the local store.
pub fn default_storage_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "pushbeacon", "beacon") {
        proj_dirs.data_dir().join("beacon.db")
    } else {
        PathBuf::from("beacon.db")
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_path)
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec!["application.code".to_string()],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    config.event_bus.channel_capacity = config.event_bus.channel_capacity.max(1);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        application_code: std::env::var("BEACON_APPLICATION_CODE").ok(),
        api_endpoint: std::env::var("BEACON_API_ENDPOINT").ok(),
        user_id: std::env::var("BEACON_USER_ID").ok(),
        log_level: std::env::var("BEACON_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(code) = overrides.application_code {
        config.application.code = code;
    }
    if let Some(endpoint) = overrides.api_endpoint {
        config.application.api_endpoint = endpoint;
    }
    if let Some(user_id) = overrides.user_id {
        config.application.user_id = Some(user_id);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

/// Application codes look like `ABCDE-12345`.
pub fn is_valid_application_code(code: &str) -> bool {
    let Some((left, right)) = code.split_once('-') else {
        return false;
    };
    left.len() == 5
        && right.len() == 5
        && left
            .chars()
            .chain(right.chars())
            .all(|c| c.is_ascii_alphanumeric())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.application.code.is_empty() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["application.code".to_string()],
        });
    }

    if !is_valid_application_code(&config.application.code) {
        return Err(ConfigError::InvalidValue {
            field: "application.code".to_string(),
            message: "expected format XXXXX-XXXXX".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.inbox.page_size == 0 || config.inbox.page_size > MAX_PAGE_SIZE {
        return Err(ConfigError::InvalidValue {
            field: "inbox.page_size".to_string(),
            message: format!("must be between 1 and {MAX_PAGE_SIZE}"),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
