//! Configuration loading with layered overrides.
//!
//! Config is loaded in order (each layer overrides the previous):
//! 1. Default values
//! 2. Config file (TOML)
//! 3. Environment variables
//! 4. CLI arguments
//!
//! The rate limit section is validated after all layers are applied, so a
//! misconfigured limiter fails at startup rather than on the first request.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Config shared between the server and every request context.
pub type SharedConfig = Arc<Config>;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    /// Server-wide per-IP rate limit. Disabled when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to make cross-origin requests. `"*"` allows any.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Send `Strict-Transport-Security` on every response.
    #[serde(default)]
    pub hsts: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            hsts: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Token bucket parameters for the server-wide limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Burst size: requests a fresh client may make back to back.
    pub capacity: f64,
    /// Sustained requests per second.
    pub refill_per_sec: f64,
    /// Buckets idle this long (and full) are dropped by the periodic sweep.
    #[serde(default = "default_sweep_idle_secs")]
    pub sweep_idle_secs: u64,
}

impl RateLimit {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            sweep_idle_secs: default_sweep_idle_secs(),
        }
    }

    fn validate(&self) -> crate::Result<()> {
        crate::rate_limit::validate(self.capacity, self.refill_per_sec)?;
        if self.sweep_idle_secs == 0 {
            return Err(Error::Config(
                "rate limit sweep_idle_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_sweep_idle_secs() -> u64 {
    300
}

/// Builder for loading configuration with customizable options.
#[derive(Debug, Clone)]
pub struct Loader {
    /// Environment variable prefix (e.g., "MYAPP" -> MYAPP_HOST, MYAPP_PORT)
    pub env_prefix: String,
}

impl Default for Loader {
    fn default() -> Self {
        Self {
            env_prefix: "HOMESTEAD".to_string(),
        }
    }
}

impl Loader {
    /// Create a new config loader with the given environment prefix.
    pub fn new(env_prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: env_prefix.into(),
        }
    }

    /// Load configuration from file, environment, and CLI arguments.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `cli_host` - CLI override for host
    /// * `cli_port` - CLI override for port
    pub fn load(
        &self,
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
    ) -> crate::Result<Config> {
        // Start with file config or defaults
        let mut config: Config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?
        } else {
            Config::default()
        };

        // Override with environment variables
        let prefix = &self.env_prefix;

        if let Ok(host) = std::env::var(format!("{prefix}_HOST")) {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var(format!("{prefix}_PORT"))
            && let Ok(p) = port.parse()
        {
            config.server.port = p;
        }
        self.apply_rate_limit_env(&mut config)?;

        // Override with CLI arguments
        if let Some(host) = cli_host {
            config.server.host = host.to_string();
        }
        if let Some(port) = cli_port {
            config.server.port = port;
        }

        if let Some(rate_limit) = &config.rate_limit {
            rate_limit.validate()?;
        }

        Ok(config)
    }

    /// Environment can enable the limiter on its own, but only when both
    /// bucket parameters are known after merging with the file.
    fn apply_rate_limit_env(&self, config: &mut Config) -> crate::Result<()> {
        let prefix = &self.env_prefix;
        let capacity = env_f64(&format!("{prefix}_RATE_LIMIT_CAPACITY"))?;
        let refill = env_f64(&format!("{prefix}_RATE_LIMIT_REFILL_PER_SEC"))?;

        if capacity.is_none() && refill.is_none() {
            return Ok(());
        }

        match config.rate_limit.as_mut() {
            Some(existing) => {
                if let Some(c) = capacity {
                    existing.capacity = c;
                }
                if let Some(r) = refill {
                    existing.refill_per_sec = r;
                }
            }
            None => {
                let (Some(c), Some(r)) = (capacity, refill) else {
                    return Err(Error::Config(format!(
                        "{prefix}_RATE_LIMIT_CAPACITY and {prefix}_RATE_LIMIT_REFILL_PER_SEC must be set together"
                    )));
                };
                config.rate_limit = Some(RateLimit::new(c, r));
            }
        }
        Ok(())
    }
}

fn env_f64(name: &str) -> crate::Result<Option<f64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} must be a number, got {value:?}"))),
        Err(_) => Ok(None),
    }
}
