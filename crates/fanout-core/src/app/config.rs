//! Engine configuration.
//!
//! Built with `with_*` methods, deserialized from a config document, or read
//! from `FANOUT_*` environment variables (`from_env`). Call
//! `dotenvy::dotenv().ok()` first to pick up a local `.env`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::EngineError;

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent worker slots.
    pub workers: usize,

    /// How long the shutdown path waits for in-flight `handle` calls.
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    /// Exit the process after the shutdown path completes.
    pub exit_on_shutdown: bool,

    /// Route SIGINT / SIGTERM to the shutdown path during `work()`.
    pub handle_signals: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            exit_on_shutdown: false,
            handle_signals: true,
        }
    }
}

impl EngineConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_exit_on_shutdown(mut self, exit: bool) -> Self {
        self.exit_on_shutdown = exit;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Fail fast on values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidWorkerCount);
        }
        Ok(())
    }

    /// Load from `FANOUT_WORKERS`, `FANOUT_DRAIN_TIMEOUT_SECS`,
    /// `FANOUT_EXIT_ON_SHUTDOWN` and `FANOUT_HANDLE_SIGNALS`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("FANOUT_WORKERS") {
            config.workers = parse_var("FANOUT_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("FANOUT_DRAIN_TIMEOUT_SECS") {
            config.drain_timeout = Duration::from_secs(parse_var("FANOUT_DRAIN_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("FANOUT_EXIT_ON_SHUTDOWN") {
            config.exit_on_shutdown = parse_var("FANOUT_EXIT_ON_SHUTDOWN", &raw)?;
        }
        if let Some(raw) = lookup("FANOUT_HANDLE_SIGNALS") {
            config.handle_signals = parse_var("FANOUT_HANDLE_SIGNALS", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, EngineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| EngineError::Config(format!("{name}={raw:?}: {e}")))
}

/// Serde support for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(!config.exit_on_shutdown);
        assert!(config.handle_signals);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new(10)
            .with_drain_timeout(Duration::from_secs(5))
            .with_exit_on_shutdown(true)
            .with_signal_handling(false);

        assert_eq!(config.workers, 10);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert!(config.exit_on_shutdown);
        assert!(!config.handle_signals);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkerCount));
    }

    #[test]
    fn from_lookup_reads_fanout_vars() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("FANOUT_WORKERS", "3"),
            ("FANOUT_DRAIN_TIMEOUT_SECS", "2"),
            ("FANOUT_EXIT_ON_SHUTDOWN", "true"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert!(config.exit_on_shutdown);
        assert!(config.handle_signals);
    }

    #[test]
    fn from_lookup_reports_bad_values() {
        let err = EngineConfig::from_lookup(lookup(&[("FANOUT_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg.contains("FANOUT_WORKERS")));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"workers": 4, "drain_timeout": 1})).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.drain_timeout, Duration::from_secs(1));
        assert!(config.handle_signals);
    }
}
