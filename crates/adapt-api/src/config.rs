//! Service configuration.
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults
//! 2. `config/default.toml` (optional)
//! 3. the file named by `ADAPT_CONFIG` (optional)
//! 4. `ADAPT__<SECTION>__<KEY>` environment variables
//! 5. the legacy `JWT_SECRET`, `REDIS_URL` and `PORT` variables

use adapt_admission::throttle::{DEFAULT_LIMIT, DEFAULT_PREFIX, DEFAULT_WINDOW};
use adapt_admission::store::DEFAULT_STORE_TIMEOUT;
use adapt_admission::{FailureMode, ThrottlePolicy};
use anyhow::{bail, Context};
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub throttle: ThrottleSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Take the caller's address from the first `x-forwarded-for` hop.
    pub trust_forwarded_for: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub limit: u64,
    pub window_ms: u64,
    pub failure_mode: FailureMode,
    pub prefix: String,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            failure_mode: FailureMode::default(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ThrottleSettings {
    pub fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            limit: self.limit,
            window: Duration::from_millis(self.window_ms),
            failure_mode: self.failure_mode,
            prefix: self.prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl_ms: 300_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Default filter; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from files and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));

        if let Ok(path) = std::env::var("ADAPT_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("ADAPT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("failed to parse configuration")?;
        settings.apply_legacy_env(|name| std::env::var(name).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document, without consulting the
    /// environment.
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_legacy_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = var("JWT_SECRET").filter(|s| !s.is_empty()) {
            self.auth.secret = secret;
        }
        if let Some(url) = var("REDIS_URL").filter(|s| !s.is_empty()) {
            self.store.backend = StoreBackend::Redis;
            self.store.redis_url = Some(url);
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.secret.is_empty() {
            bail!("auth.secret must be set (ADAPT__AUTH__SECRET or JWT_SECRET)");
        }
        if self.auth.token_ttl_secs == 0 {
            bail!("auth.token_ttl_secs must be greater than zero");
        }
        if self.throttle.limit == 0 {
            bail!("throttle.limit must be greater than zero");
        }
        if self.throttle.window_ms == 0 {
            bail!("throttle.window_ms must be greater than zero");
        }
        if self.store.timeout_ms == 0 {
            bail!("store.timeout_ms must be greater than zero");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            bail!("store.redis_url is required for the redis backend");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
