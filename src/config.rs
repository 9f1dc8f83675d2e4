//! Configuration management for Meshguard.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::breaker::{DEFAULT_THRESHOLD, DEFAULT_TIMEOUT};
use crate::error::{MeshGuardError, Result};
use crate::ratelimit::{DEFAULT_REQUESTS, DEFAULT_WINDOW};

/// Prefix for environment variable overrides, e.g. `MESHGUARD__RATE_LIMIT__REQUESTS`.
pub const ENV_PREFIX: &str = "MESHGUARD";

/// Main configuration for the Meshguard service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshGuardConfig {
    /// Global rate limiting settings
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Global circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Status reporting settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Services registered at startup
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Rate limiting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether rate limiting is applied at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests allowed per window
    #[serde(default = "default_requests")]
    pub requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            requests: default_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Whether circuit breaking is applied at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that open a circuit
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Seconds an open circuit waits before probing
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CircuitBreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            threshold: default_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Status reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Seconds between status reports; zero disables reporting
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
        }
    }
}

/// Per-service overrides. Unset fields fall back to the global settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default)]
    pub rate_limit: Option<ServiceRateLimit>,

    #[serde(default)]
    pub circuit_breaker: Option<ServiceCircuitBreaker>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRateLimit {
    pub requests: Option<u64>,
    pub window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceCircuitBreaker {
    pub threshold: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate_limit: None,
            circuit_breaker: None,
        }
    }

    /// Effective `(requests, window)` for this service.
    pub fn rate_limit_for(&self, global: &RateLimitSettings) -> (u64, Duration) {
        let overrides = self.rate_limit.clone().unwrap_or_default();
        (
            overrides.requests.unwrap_or(global.requests),
            Duration::from_secs(overrides.window_secs.unwrap_or(global.window_secs)),
        )
    }

    /// Effective `(threshold, timeout)` for this service.
    pub fn circuit_breaker_for(&self, global: &CircuitBreakerSettings) -> (u32, Duration) {
        let overrides = self.circuit_breaker.clone().unwrap_or_default();
        (
            overrides.threshold.unwrap_or(global.threshold),
            Duration::from_secs(overrides.timeout_secs.unwrap_or(global.timeout_secs)),
        )
    }
}

fn default_enabled() -> bool {
    true
}

fn default_requests() -> u64 {
    DEFAULT_REQUESTS
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW.as_secs()
}

fn default_threshold() -> u32 {
    DEFAULT_THRESHOLD
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_report_interval() -> u64 {
    30
}

impl MeshGuardConfig {
    /// Load configuration from defaults, an optional YAML file, and
    /// `MESHGUARD__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: MeshGuardConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: MeshGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| MeshGuardError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unusable configuration; warn about settings that make a stage reject everything.
    pub fn validate(&self) -> Result<()> {
        debug!(services = self.services.len(), "Validating configuration");

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(MeshGuardError::Config(
                    "Service name must not be empty".to_string(),
                ));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(MeshGuardError::Config(format!(
                    "Duplicate service name in configuration: {}",
                    service.name
                )));
            }
        }

        warn_rate_limit("global", self.rate_limit.requests, self.rate_limit.window_secs);
        warn_threshold("global", self.circuit_breaker.threshold);

        for service in &self.services {
            let (requests, window) = service.rate_limit_for(&self.rate_limit);
            warn_rate_limit(&service.name, requests, window.as_secs());
            let (threshold, _) = service.circuit_breaker_for(&self.circuit_breaker);
            warn_threshold(&service.name, threshold);
        }

        Ok(())
    }
}

fn warn_rate_limit(scope: &str, requests: u64, window_secs: u64) {
    if requests == 0 {
        warn!(scope = %scope, "Rate limit of 0 requests rejects every request");
    }
    if window_secs == 0 {
        warn!(scope = %scope, "Rate limit window of 0 seconds never retains a request");
    }
}

fn warn_threshold(scope: &str, threshold: u32) {
    if threshold == 0 {
        warn!(scope = %scope, "Circuit breaker threshold of 0 behaves as 1");
    }
}
