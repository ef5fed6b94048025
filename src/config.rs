//! Environment-driven configuration.
//!
//! Every tunable has a working default so a dashboard client can run
//! with nothing set; the hosted-service URL and keys are only required
//! by the code paths that actually reach the wire. Invalid values fall
//! back to the default rather than failing startup.

use std::time::Duration;

use crate::retry::RetryPolicy;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
const DEFAULT_IDLE_SWEEP_SECS: u64 = 60;
const DEFAULT_IDLE_MAX_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("REALTIME_URL is not set")]
    MissingUrl,
    #[error("REALTIME_ANON_KEY is not set")]
    MissingAnonKey,
    #[error("REALTIME_SERVICE_KEY is not set; privileged broadcast unavailable")]
    MissingServiceKey,
}

/// Tuning knobs and credentials for the realtime layer.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Hosted service WebSocket URL.
    pub url: Option<String>,
    /// Public client key, sent by browser-equivalent surfaces.
    pub anon_key: Option<String>,
    /// Privileged key; gates server-side broadcast helpers.
    pub service_key: Option<String>,
    pub heartbeat_interval: Duration,
    pub subscribe_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub idle_sweep_interval: Duration,
    pub idle_max_age: Duration,
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        let base_ms = env_parse("REALTIME_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS);
        let cap_ms = env_parse("REALTIME_RECONNECT_CAP_MS", DEFAULT_RECONNECT_CAP_MS);

        Self {
            url: env_string("REALTIME_URL"),
            anon_key: env_string("REALTIME_ANON_KEY"),
            service_key: env_string("REALTIME_SERVICE_KEY"),
            heartbeat_interval: Duration::from_secs(env_parse("REALTIME_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)),
            subscribe_timeout: Duration::from_secs(env_parse(
                "REALTIME_SUBSCRIBE_TIMEOUT_SECS",
                DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
            )),
            reconnect: RetryPolicy::new(
                u32::MAX,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            ),
            idle_sweep_interval: Duration::from_secs(env_parse("REALTIME_IDLE_SWEEP_SECS", DEFAULT_IDLE_SWEEP_SECS)),
            idle_max_age: Duration::from_secs(env_parse("REALTIME_IDLE_MAX_SECS", DEFAULT_IDLE_MAX_SECS)),
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUrl`] when no URL is configured.
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url.as_deref().ok_or(ConfigError::MissingUrl)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::MissingAnonKey`] when no public key is configured.
    pub fn require_anon_key(&self) -> Result<&str, ConfigError> {
        self.anon_key.as_deref().ok_or(ConfigError::MissingAnonKey)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServiceKey`] when no privileged key
    /// is configured.
    pub fn require_service_key(&self) -> Result<&str, ConfigError> {
        self.service_key.as_deref().ok_or(ConfigError::MissingServiceKey)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            service_key: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            subscribe_timeout: Duration::from_secs(DEFAULT_SUBSCRIBE_TIMEOUT_SECS),
            reconnect: RetryPolicy::new(
                u32::MAX,
                Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
                Duration::from_millis(DEFAULT_RECONNECT_CAP_MS),
            ),
            idle_sweep_interval: Duration::from_secs(DEFAULT_IDLE_SWEEP_SECS),
            idle_max_age: Duration::from_secs(DEFAULT_IDLE_MAX_SECS),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T>(value: Option<&str>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    value.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
