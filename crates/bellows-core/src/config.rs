//! Runtime settings for the master daemon.
//!
//! Everything is sourced from the environment, with the same defaults the
//! rest of the fabric ships with.

/// Default build config filename looked up in repositories.
pub const DEFAULT_CONFIG_FILENAME: &str = "bellows.yml";

/// Default build config format.
pub const DEFAULT_CONFIG_TYPE: &str = "yaml";

/// Settings consumed by the build orchestration core.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum database connections in the pool.
    pub database_max_connections: u32,

    pub poller_host: String,
    pub poller_port: u16,
    pub poller_uses_ssl: bool,
    pub validate_cert_poller: bool,
    pub poller_token: String,

    pub secrets_host: String,
    pub secrets_port: u16,
    pub secrets_uses_ssl: bool,
    pub validate_cert_secrets: bool,
    pub secrets_token: String,

    /// Format of the in-repo build config (`yaml`).
    pub build_config_type: String,
    /// Filename of the in-repo build config.
    pub build_config_filename: String,

    /// Base URL of the notifications web API.
    pub notifications_api_url: String,
    /// Token sent in the `Authorization` header to the notifications API.
    pub notifications_api_token: String,

    /// Interval between poll requests per repository, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://bellows.db".to_string(),
            database_max_connections: 20,
            poller_host: "localhost".to_string(),
            poller_port: 9922,
            poller_uses_ssl: false,
            validate_cert_poller: false,
            poller_token: String::new(),
            secrets_host: "localhost".to_string(),
            secrets_port: 9745,
            secrets_uses_ssl: false,
            validate_cert_secrets: false,
            secrets_token: String::new(),
            build_config_type: DEFAULT_CONFIG_TYPE.to_string(),
            build_config_filename: DEFAULT_CONFIG_FILENAME.to_string(),
            notifications_api_url: "http://localhost:9432/".to_string(),
            notifications_api_token: String::new(),
            poll_interval_secs: 300,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Settings {
    /// Loads settings from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            database_max_connections: env_parse(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            poller_host: env_string("POLLER_HOST", &defaults.poller_host),
            poller_port: env_parse("POLLER_PORT", defaults.poller_port),
            poller_uses_ssl: env_bool("POLLER_USES_SSL", defaults.poller_uses_ssl),
            validate_cert_poller: env_bool(
                "VALIDATE_CERT_POLLER",
                defaults.validate_cert_poller,
            ),
            poller_token: env_string("POLLER_TOKEN", &defaults.poller_token),
            secrets_host: env_string("SECRETS_HOST", &defaults.secrets_host),
            secrets_port: env_parse("SECRETS_PORT", defaults.secrets_port),
            secrets_uses_ssl: env_bool("SECRETS_USES_SSL", defaults.secrets_uses_ssl),
            validate_cert_secrets: env_bool(
                "VALIDATE_CERT_SECRETS",
                defaults.validate_cert_secrets,
            ),
            secrets_token: env_string("SECRETS_TOKEN", &defaults.secrets_token),
            build_config_type: env_string("BUILD_CONFIG_TYPE", DEFAULT_CONFIG_TYPE),
            build_config_filename: env_string(
                "BUILD_CONFIG_FILENAME",
                DEFAULT_CONFIG_FILENAME,
            ),
            notifications_api_url: env_string(
                "NOTIFICATIONS_API_URL",
                &defaults.notifications_api_url,
            ),
            notifications_api_token: env_string("NOTIFICATIONS_API_TOKEN", ""),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
        }
    }
}
