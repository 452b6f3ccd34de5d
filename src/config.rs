//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Quota, WindowStrategy};

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__TIMEOUT_MS=100`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile admission core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Quotas applied by the admission pipeline
    #[serde(default)]
    pub limits: LimitsConfig,

    /// How window counters partition time
    #[serde(default)]
    pub window_strategy: WindowStrategy,

    /// Shared state store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Burst limiter record settings
    #[serde(default)]
    pub buckets: BucketConfig,

    /// Distributed lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Service-to-service budgets
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// The four quotas recognised by the admission pipeline.
///
/// Any key omitted from a configuration file falls back to its compiled-in
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Budget shared by every request
    #[serde(default = "default_global")]
    pub global: Quota,

    /// Default per-user budget
    #[serde(default = "default_user")]
    pub user: Quota,

    /// Default per-API-key budget
    #[serde(default = "default_api")]
    pub api: Quota,

    /// Short-term shaping for the token and leaky buckets
    #[serde(default = "default_burst")]
    pub burst: Quota,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global(),
            user: default_user(),
            api: default_api(),
            burst: default_burst(),
        }
    }
}

fn default_global() -> Quota {
    Quota::new(60, 1000)
}

fn default_user() -> Quota {
    Quota::new(60, 100)
}

fn default_api() -> Quota {
    Quota::new(60, 1000)
}

fn default_burst() -> Quota {
    Quota::new(10, 30)
}

/// Shared state store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline for a single store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Interval between expired-key sweeps of the in-memory store
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_timeout() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    60
}

/// Burst limiter record settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Idle lifetime of a bucket record before it is recreated from scratch
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl BucketConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

fn default_idle_ttl() -> u64 {
    3600
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lifetime of a lock that is never released
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_ms: u64,

    /// How long `acquire_with_retry` keeps trying
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// First retry delay
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl(),
            acquire_timeout_ms: default_acquire_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    30_000
}

fn default_acquire_timeout() -> u64 {
    10_000
}

fn default_initial_backoff() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    1_000
}

/// Service-to-service budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Budget for callers without an entry in `services`
    #[serde(default = "default_service_budget")]
    pub default_budget: Quota,

    /// Budgets by calling service name
    #[serde(default)]
    pub services: HashMap<String, Quota>,

    #[serde(default)]
    pub window_strategy: WindowStrategy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_budget: default_service_budget(),
            services: HashMap::new(),
            window_strategy: WindowStrategy::default(),
        }
    }
}

fn default_service_budget() -> Quota {
    Quota::new(60, 600)
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every configured quota against its invariants.
    pub fn validate(&self) -> Result<()> {
        for (name, quota) in [
            ("global", self.limits.global),
            ("user", self.limits.user),
            ("api", self.limits.api),
            ("burst", self.limits.burst),
        ] {
            quota
                .validate()
                .map_err(|e| TurnstileError::Config(format!("limits.{}: {}", name, e)))?;
        }
        self.gateway
            .default_budget
            .validate()
            .map_err(|e| TurnstileError::Config(format!("gateway.default_budget: {}", e)))?;
        for (service, budget) in &self.gateway.services {
            budget
                .validate()
                .map_err(|e| TurnstileError::Config(format!("gateway.services.{}: {}", service, e)))?;
        }
        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config("store.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}
