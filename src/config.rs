//! In-memory config store: a thread-safe map from circuit name to tunables, with lazy default
//! creation on first access.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::rolling::DEFAULT_WINDOW_SECS;

/// Tunables for one circuit. All fields default to the values in SPEC_FULL.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandConfig {
    pub timeout: Duration,
    pub max_concurrent_requests: usize,
    pub request_volume_threshold: u64,
    pub sleep_window: Duration,
    pub error_percent_threshold: u32,
    pub rolling_window_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_concurrent_requests: 10,
            request_volume_threshold: 20,
            sleep_window: Duration::from_millis(5000),
            error_percent_threshold: 50,
            rolling_window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

/// Sparse overrides applied on top of [`CommandConfig::default`]. Any field left `None` keeps
/// its default (or, for a circuit already configured, is left unset only at first registration —
/// `ConfigStore::configure_command` replaces the whole record).
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandConfigOverrides {
    pub timeout: Option<Duration>,
    pub max_concurrent_requests: Option<usize>,
    pub request_volume_threshold: Option<u64>,
    pub sleep_window: Option<Duration>,
    pub error_percent_threshold: Option<u32>,
    pub rolling_window_secs: Option<u64>,
}

impl CommandConfigOverrides {
    fn apply(self, base: CommandConfig) -> CommandConfig {
        CommandConfig {
            timeout: self.timeout.unwrap_or(base.timeout),
            max_concurrent_requests: self.max_concurrent_requests.unwrap_or(base.max_concurrent_requests),
            request_volume_threshold: self.request_volume_threshold.unwrap_or(base.request_volume_threshold),
            sleep_window: self.sleep_window.unwrap_or(base.sleep_window),
            error_percent_threshold: self.error_percent_threshold.unwrap_or(base.error_percent_threshold),
            rolling_window_secs: self.rolling_window_secs.unwrap_or(base.rolling_window_secs),
        }
    }
}

/// Thread-safe name -> [`CommandConfig`] map, used by a [`crate::registry::Runtime`].
#[derive(Default)]
pub struct ConfigStore {
    configs: RwLock<HashMap<String, CommandConfig>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the circuit's config, creating a default-initialized one on first access.
    pub fn get(&self, name: &str) -> CommandConfig {
        if let Some(cfg) = self.configs.read().get(name) {
            return *cfg;
        }
        let mut configs = self.configs.write();
        *configs.entry(name.to_string()).or_insert_with(CommandConfig::default)
    }

    /// Replaces the circuit's config with `overrides` applied on top of the defaults.
    pub fn configure_command(&self, name: &str, overrides: CommandConfigOverrides) {
        let resolved = overrides.apply(CommandConfig::default());
        self.configs.write().insert(name.to_string(), resolved);
    }

    /// Applies a batch of overrides.
    pub fn configure(&self, overrides: HashMap<String, CommandConfigOverrides>) {
        for (name, o) in overrides {
            self.configure_command(&name, o);
        }
    }

    pub fn flush(&self) {
        self.configs.write().clear();
    }
}
