use std::env;

use crate::analytics::AnalyticsSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Outbound frames buffered per device session before the
    /// slow-consumer policy drops the session.
    pub outbound_buffer: usize,
    /// Ingress default when a command dispatch carries no timeout.
    pub command_timeout_ms: u64,
    /// Ingress default for content dispatch; media transfers are slow.
    pub content_timeout_ms: u64,
    pub analytics_max_batch: usize,
    pub analytics_retention: usize,
    pub analytics_backoff_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: parse_env("MARQUEE_HUB_PORT", 8080),
            outbound_buffer: parse_env("MARQUEE_OUTBOUND_BUFFER", 32),
            command_timeout_ms: parse_env("MARQUEE_COMMAND_TIMEOUT_MS", 10_000),
            content_timeout_ms: parse_env("MARQUEE_CONTENT_TIMEOUT_MS", 60_000),
            analytics_max_batch: parse_env("MARQUEE_ANALYTICS_MAX_BATCH", 500),
            analytics_retention: parse_env("MARQUEE_ANALYTICS_RETENTION", 1024),
            analytics_backoff_ms: parse_env("MARQUEE_ANALYTICS_BACKOFF_MS", 1000),
        }
    }

    pub fn analytics_settings(&self) -> AnalyticsSettings {
        AnalyticsSettings {
            max_batch_size: self.analytics_max_batch,
            retention_per_device: self.analytics_retention,
            backoff_ms: self.analytics_backoff_ms,
            ..AnalyticsSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            outbound_buffer: 32,
            command_timeout_ms: 10_000,
            content_timeout_ms: 60_000,
            analytics_max_batch: 500,
            analytics_retention: 1024,
            analytics_backoff_ms: 1000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}
