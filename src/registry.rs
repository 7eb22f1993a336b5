//! Process-wide (or explicit) registry mapping circuit name to its breaker, and the default
//! `Runtime` that backs the free functions in `lib.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::circuit::CircuitBreaker;
use crate::config::{CommandConfig, CommandConfigOverrides, ConfigStore};

/// Owns the name-indexed circuit breaker map and the config store that seeds it. Every public
/// entry point in `lib.rs` resolves through either an explicit `Runtime` or the process-wide
/// default.
#[derive(Default)]
pub struct Runtime {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: ConfigStore,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named circuit's breaker, creating it (and its pool and metric collector) on
    /// first use. Double-checked: a read lock miss is followed by a write lock with a recheck, so
    /// concurrent first-callers never create duplicate breakers for the same name.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.breakers.read().get(name) {
            return cb.clone();
        }

        let mut breakers = self.breakers.write();
        if let Some(cb) = breakers.get(name) {
            return cb.clone();
        }

        let config = self.config.get(name);
        let cb = CircuitBreaker::new(name, &config);
        breakers.insert(name.to_string(), cb.clone());
        cb
    }

    pub fn get_circuit_config(&self, name: &str) -> CommandConfig {
        self.config.get(name)
    }

    pub fn configure_command(&self, name: &str, overrides: CommandConfigOverrides) {
        self.config.configure_command(name, overrides);
    }

    pub fn configure(&self, overrides: HashMap<String, CommandConfigOverrides>) {
        self.config.configure(overrides);
    }

    /// Clears the registry and the config store. Circuits created after a flush start fresh.
    pub fn flush(&self) {
        self.breakers.write().clear();
        self.config.flush();
    }
}

/// The process-wide default runtime backing `faultline::go`/`do_`/etc.
pub static DEFAULT: Lazy<Runtime> = Lazy::new(Runtime::new);
