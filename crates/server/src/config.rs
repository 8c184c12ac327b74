use std::{net::SocketAddr, str::FromStr, time::Duration};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

/// Shortest accepted HMAC secret for access tokens, in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC-SHA256 secret for access tokens. A random secret is generated at
    /// startup when absent, which invalidates tokens across restarts.
    pub jwt_secret: Option<String>,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl AuthConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    pub outbound_queue_capacity: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            max_message_size: 4096,
        }
    }
}

impl HubConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Pings go out at 90% of the pong deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            window_secs: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub refresh_sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            refresh_sweep_interval_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics: MetricsConfig,
    pub auth: AuthConfig,
    pub hub: HubConfig,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            hub: HubConfig::default(),
            rate_limit: RateLimitConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Values supplied on the command line; applied after files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub jwt_secret: Option<String>,
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_window_secs: Option<u64>,
}

impl ServerConfig {
    pub const ENV_PREFIX: &'static str = "PARLEY_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(secret) = &overrides.jwt_secret {
            self.auth.jwt_secret = Some(secret.clone());
        }
        if let Some(capacity) = overrides.rate_limit_capacity {
            self.rate_limit.capacity = capacity;
        }
        if let Some(window) = overrides.rate_limit_window_secs {
            self.rate_limit.window_secs = window;
        }
        self.validate()
    }

    /// Names of the `PARLEY_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_ascii_lowercase))
            .collect();
        keys.sort();
        keys
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if let Some(secret) = &self.auth.jwt_secret {
            if secret.len() < MIN_JWT_SECRET_LEN {
                return Err(invalid(
                    "auth.jwt_secret",
                    format!("must be at least {MIN_JWT_SECRET_LEN} bytes"),
                ));
            }
        }

        let non_zero = [
            ("auth.access_ttl_secs", self.auth.access_ttl_secs),
            ("auth.refresh_ttl_secs", self.auth.refresh_ttl_secs),
            ("hub.outbound_queue_capacity", self.hub.outbound_queue_capacity as u64),
            ("hub.write_wait_secs", self.hub.write_wait_secs),
            ("hub.pong_wait_secs", self.hub.pong_wait_secs),
            ("hub.max_message_size", self.hub.max_message_size as u64),
            ("rate_limit.capacity", u64::from(self.rate_limit.capacity)),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            (
                "maintenance.refresh_sweep_interval_secs",
                self.maintenance.refresh_sweep_interval_secs,
            ),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero".into()));
            }
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { key, reason }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
