//! Engine configuration.

use std::time::Duration;

/// Default cap on a single envelope frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// What a [`ServiceProxy`](crate::ServiceProxy) does after its connection dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// The next call opens a fresh connection.
    #[default]
    Reconnect,
    /// Every later call fails with `ConnectionBroken`.
    DontReconnect,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest Request/Response/CancellationRequest payload accepted.
    pub max_payload_size: usize,
    /// Largest stream body accepted on an UploadStream/DownloadStream frame.
    pub max_stream_length: u64,
    /// Applied to calls that do not set their own timeout.
    pub default_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_stream_length: i32::MAX as u64,
            default_timeout: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TETHER_*` environment variables.
    ///
    /// - `TETHER_MAX_PAYLOAD`: bytes
    /// - `TETHER_MAX_STREAM`: bytes
    /// - `TETHER_DEFAULT_TIMEOUT_SECS`: seconds, fractional allowed, `0` disables
    /// - `TETHER_RECONNECT`: `never` selects [`ReconnectPolicy::DontReconnect`]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("TETHER_MAX_PAYLOAD") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_payload_size = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid TETHER_MAX_PAYLOAD"),
            }
        }

        if let Some(raw) = lookup("TETHER_MAX_STREAM") {
            match raw.trim().parse::<u64>() {
                Ok(n) if n <= i32::MAX as u64 => config.max_stream_length = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid TETHER_MAX_STREAM"),
            }
        }

        if let Some(raw) = lookup("TETHER_DEFAULT_TIMEOUT_SECS") {
            match raw.trim().parse::<f64>() {
                Ok(s) if s.is_finite() && s > 0.0 => {
                    config.default_timeout = Some(Duration::from_secs_f64(s))
                }
                Ok(s) if s == 0.0 => config.default_timeout = None,
                _ => tracing::warn!(value = %raw, "Ignoring invalid TETHER_DEFAULT_TIMEOUT_SECS"),
            }
        }

        if let Some(raw) = lookup("TETHER_RECONNECT") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "never" | "false" | "0" => config.reconnect = ReconnectPolicy::DontReconnect,
                "always" | "true" | "1" => config.reconnect = ReconnectPolicy::Reconnect,
                _ => tracing::warn!(value = %raw, "Ignoring invalid TETHER_RECONNECT"),
            }
        }

        config
    }

    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    pub fn with_max_stream_length(mut self, bytes: u64) -> Self {
        self.max_stream_length = bytes;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
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
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.max_stream_length, i32::MAX as u64);
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.reconnect, ReconnectPolicy::Reconnect);
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TETHER_MAX_PAYLOAD", "1024"),
            ("TETHER_MAX_STREAM", "4096"),
            ("TETHER_DEFAULT_TIMEOUT_SECS", "1.5"),
            ("TETHER_RECONNECT", "never"),
        ]));
        assert_eq!(config.max_payload_size, 1024);
        assert_eq!(config.max_stream_length, 4096);
        assert_eq!(config.default_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.reconnect, ReconnectPolicy::DontReconnect);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TETHER_MAX_PAYLOAD", "lots"),
            ("TETHER_MAX_STREAM", "99999999999"),
            ("TETHER_DEFAULT_TIMEOUT_SECS", "-3"),
            ("TETHER_RECONNECT", "sometimes"),
        ]));
        let defaults = EngineConfig::default();
        assert_eq!(config.max_payload_size, defaults.max_payload_size);
        assert_eq!(config.max_stream_length, defaults.max_stream_length);
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.reconnect, ReconnectPolicy::Reconnect);
    }

    #[test]
    fn builder_methods() {
        let config = EngineConfig::new()
            .with_max_payload_size(10)
            .with_max_stream_length(20)
            .with_default_timeout(Some(Duration::from_secs(3)))
            .with_reconnect_policy(ReconnectPolicy::DontReconnect);
        assert_eq!(config.max_payload_size, 10);
        assert_eq!(config.max_stream_length, 20);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.reconnect, ReconnectPolicy::DontReconnect);
    }
}
