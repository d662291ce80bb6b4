//! Lazily populated set of breakers keyed by backend name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::state::{BreakerConfig, BreakerStats, CircuitBreaker, StateChangeCallback};

/// One breaker per backend name, sharing a single configuration.
///
/// Construct one per process and hand it to whatever needs health checks;
/// there is no global instance.
#[derive(Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    on_state_change: Option<StateChangeCallback>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            on_state_change: None,
        }
    }

    /// Build a registry from the `[breaker]` section of the configuration.
    pub fn from_config(config: &conductor_core::Config) -> Self {
        Self::new(BreakerConfig::from(&config.breaker))
    }

    /// Attach a callback inherited by every breaker created afterwards.
    #[must_use]
    pub fn with_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = name, "Creating circuit breaker");
            let mut breaker = CircuitBreaker::new(name, self.config);
            if let Some(callback) = &self.on_state_change {
                breaker = breaker.with_callback(Arc::clone(callback));
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Snapshot of every cached breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Forget the breaker for `name`. The next `get` starts from closed.
    pub fn reset(&self, name: &str) -> bool {
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
