//! Configuration management for Turnstile.
//!
//! Settings come from, lowest precedence first: built-in defaults, an
//! optional YAML file, `TURNSTILE_<SECTION>__<FIELD>` environment variables,
//! and finally the short legacy variables (`RATE_LIMIT`, `WINDOW_SECONDS`,
//! `RATE_LIMIT_MODE`, `REDIS_ADDR`, `UPSTREAM_URL`, `PORT`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::quota::{FailPolicy, Mode, QuotaPolicy};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Atomic counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upstream every admitted request is forwarded to
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that sets these headers itself.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: None,
            trust_forwarded_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Requests admitted per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Counting strategy
    #[serde(default)]
    pub mode: Mode,

    /// Behaviour when the store cannot answer
    #[serde(default)]
    pub fail_policy: FailPolicy,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            mode: Mode::default(),
            fail_policy: FailPolicy::default(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

/// Which store backend holds the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    #[default]
    Redis,
    /// Process-local map; quotas are not shared between instances
    Memory,
}

/// Atomic counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Deadline for one quota transaction in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend drops expired records
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_store_url() -> String {
    "redis://redis:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    30
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {e}")))
    }

    /// Load the optional file, then layer the process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Like [`load`](Self::load) with an explicit environment.
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let prefixed = Environment::with_prefix("TURNSTILE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(env.clone().into_iter().collect()));

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&base)?)
            .add_source(prefixed);
        let builder = apply_legacy_env(builder, &env)?;

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Check the settings the gateway cannot run without.
    pub fn validate(&self) -> Result<()> {
        self.policy()?;
        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        self.upstream_uri()?;
        Ok(())
    }

    /// The quota policy described by the `quota` section.
    pub fn policy(&self) -> Result<QuotaPolicy> {
        QuotaPolicy::new(self.quota.limit, self.quota.window_secs)
    }

    /// Per-transaction store deadline.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// The parsed upstream URL. Only plain `http` upstreams are supported.
    pub fn upstream_uri(&self) -> Result<http::Uri> {
        let raw = self
            .server
            .upstream_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                TurnstileError::Config("server.upstream_url (UPSTREAM_URL) is required".to_string())
            })?;

        let uri: http::Uri = raw
            .trim()
            .parse()
            .map_err(|e| TurnstileError::Config(format!("Invalid upstream URL {raw:?}: {e}")))?;

        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(TurnstileError::Config(format!(
                "Upstream URL {raw:?} must be an absolute http:// URL"
            )));
        }
        Ok(uri)
    }
}

/// Apply the short variable names older deployments set.
///
/// Integers that do not parse are ignored and the lower layers win.
fn apply_legacy_env(
    builder: ConfigBuilder<DefaultState>,
    env: &HashMap<String, String>,
) -> Result<ConfigBuilder<DefaultState>> {
    let var = |name: &str| {
        env.get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let int = |name: &str| var(name).and_then(|v| v.parse::<u64>().ok()).map(|v| v as i64);

    let redis_url = var("REDIS_ADDR").map(|addr| {
        if addr.contains("://") {
            addr
        } else {
            format!("redis://{addr}")
        }
    });
    let listen_addr = var("PORT")
        .and_then(|port| port.parse::<u16>().ok())
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)).to_string());

    Ok(builder
        .set_override_option("quota.limit", int("RATE_LIMIT"))?
        .set_override_option("quota.window_secs", int("WINDOW_SECONDS"))?
        .set_override_option("quota.mode", var("RATE_LIMIT_MODE"))?
        .set_override_option("store.url", redis_url)?
        .set_override_option("server.upstream_url", var("UPSTREAM_URL"))?
        .set_override_option("server.listen_addr", listen_addr)?)
}
