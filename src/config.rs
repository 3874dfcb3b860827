//! Tunables for the hub and the notification fan-out engine.

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration.
///
/// Every field has a default, so a partial TOML/JSON document or an empty
/// environment both produce a usable config.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Deadline applied to every individual store call, in milliseconds.
    #[serde(default = "default_db_timeout_ms")]
    pub db_timeout_ms: u64,

    /// Number of workers writing notification rows concurrently.
    #[serde(default = "default_fanout_workers")]
    pub fanout_workers: usize,

    /// Number of notification writes that may wait for a worker.
    #[serde(default = "default_fanout_queue_capacity")]
    pub fanout_queue_capacity: usize,

    /// Page size used when a caller does not pass an explicit limit.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_db_timeout_ms() -> u64 {
    5_000
}

fn default_fanout_workers() -> usize {
    8
}

fn default_fanout_queue_capacity() -> usize {
    1_024
}

fn default_history_limit() -> usize {
    50
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            db_timeout_ms: default_db_timeout_ms(),
            fanout_workers: default_fanout_workers(),
            fanout_queue_capacity: default_fanout_queue_capacity(),
            history_limit: default_history_limit(),
        }
    }
}

impl HubConfig {
    /// Builds a config from `PULSE_HUB_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        read_var(&lookup, "PULSE_HUB_OUTBOUND_QUEUE", &mut config.outbound_queue_capacity)?;
        read_var(&lookup, "PULSE_HUB_DB_TIMEOUT_MS", &mut config.db_timeout_ms)?;
        read_var(&lookup, "PULSE_HUB_FANOUT_WORKERS", &mut config.fanout_workers)?;
        read_var(&lookup, "PULSE_HUB_FANOUT_QUEUE", &mut config.fanout_queue_capacity)?;
        read_var(&lookup, "PULSE_HUB_HISTORY_LIMIT", &mut config.history_limit)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make a channel or the worker pool unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Zero("outbound_queue_capacity"));
        }
        if self.db_timeout_ms == 0 {
            return Err(ConfigError::Zero("db_timeout_ms"));
        }
        if self.fanout_workers == 0 {
            return Err(ConfigError::Zero("fanout_workers"));
        }
        if self.fanout_queue_capacity == 0 {
            return Err(ConfigError::Zero("fanout_queue_capacity"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Zero("history_limit"));
        }
        Ok(())
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }
}

fn read_var<F, T>(lookup: &F, name: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw })?;
    }
    Ok(())
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
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = HubConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.db_timeout(), Duration::from_secs(5));
        assert_eq!(config.fanout_workers, 8);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = HubConfig::from_lookup(lookup(&[
            ("PULSE_HUB_FANOUT_WORKERS", "2"),
            ("PULSE_HUB_DB_TIMEOUT_MS", " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.fanout_workers, 2);
        assert_eq!(config.db_timeout_ms, 250);
    }

    #[test]
    fn garbage_and_zero_are_rejected() {
        let err = HubConfig::from_lookup(lookup(&[("PULSE_HUB_OUTBOUND_QUEUE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PULSE_HUB_OUTBOUND_QUEUE", .. }));

        let err = HubConfig::from_lookup(lookup(&[("PULSE_HUB_FANOUT_QUEUE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("fanout_queue_capacity")));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"fanout_workers": 3}"#).unwrap();
        assert_eq!(config.fanout_workers, 3);
        assert_eq!(config.history_limit, 50);
    }
}
