use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::ConfigError;

// Longest accepted window, 30 days. Keeps EXPIRE args and Instant math in range
pub const MAX_TIME_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

// What to do with a request when the counter store can't answer
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    // Treat as allowed, log a warning, keep serving
    Open,
    // Treat as denied, protect the backend
    Closed,
}

// CLI / environment configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "ratelimit-gateway")]
#[command(about = "Rate limiting and concurrency bounding gateway in front of a backend service")]
pub struct GatewayConfig {
    // Address to accept client traffic on
    #[arg(long, env = "GATEWAY_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    // Shared counter store, "memory://" keeps counters in-process
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379/0")]
    pub redis_url: String,

    // Backend base url
    #[arg(long, env = "PRIMARY_BACKEND", default_value = "http://127.0.0.1:8001/")]
    pub backend: String,

    // Max requests per client per window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 5)]
    pub rate_limit: u64,

    // Window length in seconds
    #[arg(long, env = "TIME_WINDOW", default_value_t = 60)]
    pub time_window: u64,

    // Max requests forwarded to the backend at once
    #[arg(long, env = "MAX_CONCURRENT_REQUESTS", default_value_t = 5)]
    pub max_concurrent: usize,

    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 250)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "BACKEND_TIMEOUT_MS", default_value_t = 5000)]
    pub backend_timeout_ms: u64,

    #[arg(long, env = "HEALTH_TIMEOUT_MS", default_value_t = 2000)]
    pub health_timeout_ms: u64,

    // Cap for buffered request and response bodies
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    // Defaults to open: a store outage degrades accuracy, not availability
    #[arg(long, env = "FAIL_POLICY", value_enum, default_value_t = FailPolicy::Open)]
    pub fail_policy: FailPolicy,

    // Take the client identity from X-Forwarded-For (only behind a trusted proxy)
    #[arg(long, env = "TRUST_FORWARDED_FOR", default_value_t = false)]
    pub trust_forwarded_for: bool,

    #[arg(long, env = "RATE_LIMIT_KEY_PREFIX", default_value = "rate_limit")]
    pub key_prefix: String,
}

impl GatewayConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    // Startup-time checks, any failure here keeps the gateway from serving
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit == 0 {
            return Err(ConfigError::Invalid("rate limit must be > 0".to_string()));
        }
        if self.time_window == 0 {
            return Err(ConfigError::Invalid("time window must be > 0".to_string()));
        }
        if self.time_window > MAX_TIME_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "time window must be <= {} seconds",
                MAX_TIME_WINDOW_SECS
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max concurrent requests must be > 0".to_string()));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max concurrent requests must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.store_timeout_ms == 0 || self.backend_timeout_ms == 0 || self.health_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max body bytes must be > 0".to_string()));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("rate limit key prefix must not be empty".to_string()));
        }
        let url = reqwest::Url::parse(&self.backend)
            .map_err(|e| ConfigError::InvalidBackend(format!("{}: {}", self.backend, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidBackend(format!(
                "{}: scheme must be http or https",
                self.backend
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> GatewayConfig {
        let mut full = vec!["ratelimit-gateway"];
        full.extend_from_slice(args);
        GatewayConfig::try_parse_from(full).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.time_window, 60);
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.fail_policy, FailPolicy::Open);
        assert_eq!(config.key_prefix, "rate_limit");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fail_policy_parses_closed() {
        let config = parse(&["--fail-policy", "closed"]);
        assert_eq!(config.fail_policy, FailPolicy::Closed);
    }

    #[test]
    fn unparseable_limit_is_rejected_by_clap() {
        let result = GatewayConfig::try_parse_from(["ratelimit-gateway", "--rate-limit", "lots"]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_values_fail_validation() {
        assert!(parse(&["--rate-limit", "0"]).validate().is_err());
        assert!(parse(&["--time-window", "0"]).validate().is_err());
        assert!(parse(&["--max-concurrent", "0"]).validate().is_err());
        assert!(parse(&["--store-timeout-ms", "0"]).validate().is_err());
        assert!(parse(&["--max-body-bytes", "0"]).validate().is_err());
    }

    #[test]
    fn oversized_values_fail_validation() {
        assert!(parse(&["--time-window", "18446744073709551615"]).validate().is_err());
        assert!(parse(&["--time-window", &(MAX_TIME_WINDOW_SECS + 1).to_string()]).validate().is_err());
        assert!(parse(&["--time-window", &MAX_TIME_WINDOW_SECS.to_string()]).validate().is_ok());

        let too_many = (Semaphore::MAX_PERMITS + 1).to_string();
        assert!(parse(&["--max-concurrent", &too_many]).validate().is_err());
    }

    #[test]
    fn backend_url_must_be_http() {
        assert!(parse(&["--backend", "not a url"]).validate().is_err());
        assert!(parse(&["--backend", "ftp://example.com"]).validate().is_err());
        assert!(parse(&["--backend", "https://example.com/api/"]).validate().is_ok());
    }
}
