//! Session configuration.

use std::time::Duration;

use dronelink_retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable that overrides [`LinkConfig::uri`].
pub const URI_ENV: &str = "DRONELINK_URI";

/// Environment variable that overrides [`LinkConfig::retry_timeout`], in
/// milliseconds.
pub const RETRY_TIMEOUT_ENV: &str = "DRONELINK_RETRY_TIMEOUT_MS";

/// Configuration for a [`LinkSession`](crate::LinkSession).
///
/// Every field has a default, so a JSON document only needs to name what
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link to open when the caller does not name one.
    pub uri: String,

    /// How long a send that expects a reply waits before resending.
    pub retry_timeout: Duration,

    /// How long one receive call on the link may block.
    pub receive_timeout: Duration,

    /// How long the receive loop sleeps while no link is open, and after a
    /// receive error.
    pub idle_poll_interval: Duration,

    /// Cap, backoff and jitter for resends.
    pub retry: RetryPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            uri: "udp://192.168.43.42:2390".to_string(),
            retry_timeout: Duration::from_millis(100),
            receive_timeout: Duration::from_secs(1),
            idle_poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl LinkConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Parses a JSON document. Missing fields keep their defaults.
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, crate::DronelinkError> {
        serde_json::from_str::<Self>(json)
            .map(Self::validated)
            .map_err(|e| crate::DronelinkError::Config(e.to_string()))
    }

    /// Applies overrides looked up through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(uri) = lookup(URI_ENV).filter(|uri| !uri.trim().is_empty()) {
            self.uri = uri.trim().to_string();
        }
        if let Some(raw) = lookup(RETRY_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.retry_timeout = Duration::from_millis(ms),
                Err(e) => warn!(key = RETRY_TIMEOUT_ENV, value = %raw, error = %e, "ignoring override"),
            }
        }
        self.validated()
    }

    /// Replace zero durations with defaults and clamp the retry policy.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.retry_timeout.is_zero() {
            warn!(default = ?defaults.retry_timeout, "retry_timeout is zero, using default");
            self.retry_timeout = defaults.retry_timeout;
        }
        if self.receive_timeout.is_zero() {
            warn!(default = ?defaults.receive_timeout, "receive_timeout is zero, using default");
            self.receive_timeout = defaults.receive_timeout;
        }
        if self.idle_poll_interval.is_zero() {
            warn!(default = ?defaults.idle_poll_interval, "idle_poll_interval is zero, using default");
            self.idle_poll_interval = defaults.idle_poll_interval;
        }
        self.retry = self.retry.validated();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_link_config_default() {
        let config = LinkConfig::default();
        assert_eq!(config.uri, "udp://192.168.43.42:2390");
        assert_eq!(config.retry_timeout, Duration::from_millis(100));
        assert_eq!(config.receive_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_poll_interval, Duration::from_secs(1));
        assert_eq!(config.retry, RetryPolicy::unbounded());
    }

    #[test]
    fn test_overrides_replace_uri_and_timeout() {
        let env = HashMap::from([
            (URI_ENV, "loopback://bench"),
            (RETRY_TIMEOUT_ENV, "250"),
        ]);
        let config = LinkConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.uri, "loopback://bench");
        assert_eq!(config.retry_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let config = LinkConfig::default().with_overrides(|key| match key {
            RETRY_TIMEOUT_ENV => Some("soon".to_string()),
            URI_ENV => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config, LinkConfig::default());
    }

    #[test]
    fn test_validated_replaces_zero_durations() {
        let config = LinkConfig {
            retry_timeout: Duration::ZERO,
            receive_timeout: Duration::ZERO,
            idle_poll_interval: Duration::ZERO,
            ..LinkConfig::default()
        }
        .validated();
        assert_eq!(config, LinkConfig::default());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_from_json_partial_document() {
        let config = LinkConfig::from_json(
            r#"{ "uri": "radio://0/80/2M", "retry": { "max_attempts": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.uri, "radio://0/80/2M");
        assert_eq!(config.retry.max_attempts, Some(10));
        assert_eq!(config.retry_timeout, Duration::from_millis(100));
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_validated_bounds_uncapped_backoff_from_json() {
        let config = LinkConfig::from_json(
            r#"{ "retry": { "backoff": { "kind": "exponential", "factor": 2.0,
                 "max_delay": { "secs": 18446744073709551615, "nanos": 999999999 } } } }"#,
        )
        .unwrap();
        assert_eq!(
            config.retry.backoff,
            dronelink_retry::Backoff::Exponential {
                factor: 2.0,
                max_delay: dronelink_retry::MAX_RETRY_DELAY,
            }
        );
        assert!(config.retry.delay(config.retry_timeout, 200) <= dronelink_retry::MAX_RETRY_DELAY);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_from_json_rejects_garbage() {
        let err = LinkConfig::from_json("{ uri: ").unwrap_err();
        assert!(matches!(err, crate::DronelinkError::Config(_)));
    }
}
