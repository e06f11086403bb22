//! Relay Configuration
//!
//! Read once from the environment at startup.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_TOKEN: &str = "HEALER_RELAY_TOKEN";
pub const ENV_ADDR: &str = "HEALER_RELAY_ADDR";
pub const ENV_HTTP_ADDR: &str = "HEALER_RELAY_HTTP_ADDR";
pub const ENV_RATE_LIMIT: &str = "HEALER_RELAY_RATE_LIMIT";
pub const ENV_RETRY_MS: &str = "HEALER_RELAY_RETRY_MS";
pub const ENV_CLEANUP_MS: &str = "HEALER_RELAY_CLEANUP_MS";
pub const ENV_DELIVERED_TTL_MS: &str = "HEALER_RELAY_DELIVERED_TTL_MS";
pub const ENV_ACK_TIMEOUT_MS: &str = "HEALER_RELAY_ACK_TIMEOUT_MS";
pub const ENV_MAX_MESSAGE_BYTES: &str = "HEALER_RELAY_MAX_MESSAGE_BYTES";
pub const ENV_MAX_ATTEMPT_LIMIT: &str = "HEALER_RELAY_MAX_ATTEMPT_LIMIT";
pub const ENV_BUCKET_IDLE_MS: &str = "HEALER_RELAY_BUCKET_IDLE_MS";

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Shared secret every client must present
    pub token: String,
    /// WebSocket listen address
    pub listen_addr: SocketAddr,
    /// Health/metrics listen address
    pub http_addr: SocketAddr,
    /// Inbound frames per second per client identity
    pub rate_limit_per_sec: u32,
    pub retry_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// How long delivered entries stay visible before cleanup purges them
    pub delivered_ttl_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_message_bytes: usize,
    /// Largest `attemptLimit` a client may put on an envelope
    pub max_attempt_limit: u32,
    /// Rate-limit buckets untouched for this long are dropped by cleanup
    pub bucket_idle_ms: u64,
}

impl RelayConfig {
    /// Defaults for everything except the token.
    pub fn new(token: impl Into<String>) -> Self {
        RelayConfig {
            token: token.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8091)),
            rate_limit_per_sec: 20,
            retry_interval_ms: 300,
            cleanup_interval_ms: 5_000,
            delivered_ttl_ms: 60_000,
            ack_timeout_ms: 300,
            max_message_bytes: 64 * 1024,
            max_attempt_limit: 32,
            bucket_idle_ms: 60_000,
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup(ENV_TOKEN)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingSecret(ENV_TOKEN))?;

        let mut config = RelayConfig::new(token);
        if let Some(v) = lookup(ENV_ADDR) {
            config.listen_addr = parse(ENV_ADDR, &v)?;
        }
        if let Some(v) = lookup(ENV_HTTP_ADDR) {
            config.http_addr = parse(ENV_HTTP_ADDR, &v)?;
        }
        if let Some(v) = lookup(ENV_RATE_LIMIT) {
            config.rate_limit_per_sec = parse(ENV_RATE_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_MS) {
            config.retry_interval_ms = parse(ENV_RETRY_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_CLEANUP_MS) {
            config.cleanup_interval_ms = parse(ENV_CLEANUP_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_DELIVERED_TTL_MS) {
            config.delivered_ttl_ms = parse(ENV_DELIVERED_TTL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_ACK_TIMEOUT_MS) {
            config.ack_timeout_ms = parse(ENV_ACK_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_MESSAGE_BYTES) {
            config.max_message_bytes = parse(ENV_MAX_MESSAGE_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_ATTEMPT_LIMIT) {
            config.max_attempt_limit = parse(ENV_MAX_ATTEMPT_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_BUCKET_IDLE_MS) {
            config.bucket_idle_ms = parse(ENV_BUCKET_IDLE_MS, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (ENV_RATE_LIMIT, self.rate_limit_per_sec as u64),
            (ENV_RETRY_MS, self.retry_interval_ms),
            (ENV_CLEANUP_MS, self.cleanup_interval_ms),
            (ENV_MAX_MESSAGE_BYTES, self.max_message_bytes as u64),
            (ENV_MAX_ATTEMPT_LIMIT, self.max_attempt_limit as u64),
            (ENV_BUCKET_IDLE_MS, self.bucket_idle_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".into(),
                });
            }
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_token_is_required() {
        let err = RelayConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(ENV_TOKEN)));

        let err = RelayConfig::from_lookup(lookup(&[(ENV_TOKEN, "   ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(_)));
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[(ENV_TOKEN, "s3cret")])).unwrap();
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.listen_addr.port(), 8090);
        assert_eq!(config.http_addr.port(), 8091);
        assert_eq!(config.rate_limit_per_sec, 20);
        assert_eq!(config.retry_interval(), Duration::from_millis(300));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(5));
        assert_eq!(config.delivered_ttl_ms, 60_000);
        assert_eq!(config.max_message_bytes, 65_536);
        assert_eq!(config.max_attempt_limit, 32);
        assert_eq!(config.bucket_idle_ms, 60_000);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = RelayConfig::from_lookup(lookup(&[
            (ENV_TOKEN, "t"),
            (ENV_ADDR, "0.0.0.0:9000"),
            (ENV_RATE_LIMIT, "5"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.rate_limit_per_sec, 5);

        let err = RelayConfig::from_lookup(lookup(&[(ENV_TOKEN, "t"), (ENV_RETRY_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ENV_RETRY_MS, .. }));

        let err = RelayConfig::from_lookup(lookup(&[(ENV_TOKEN, "t"), (ENV_RATE_LIMIT, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ENV_RATE_LIMIT, .. }));

        let err = RelayConfig::from_lookup(lookup(&[(ENV_TOKEN, "t"), (ENV_MAX_ATTEMPT_LIMIT, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ENV_MAX_ATTEMPT_LIMIT, .. }));
    }
}
