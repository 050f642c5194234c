//! Engine configuration.

use std::time::Duration;

/// Tuning shared by a registry and the replicas it creates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period before a dirty replica is saved
    pub save_debounce: Duration,
    /// How often the coordinator probes for idle replicas
    pub eviction_interval: Duration,
    /// Consecutive unanswered probes before a replica is evicted
    pub eviction_misses: u32,
    /// Reject unknown model tags on client registries
    pub strict_models: bool,
    /// Replica name used when none is given
    pub default_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(500),
            eviction_interval: Duration::from_secs(30),
            eviction_misses: 2,
            strict_models: true,
            default_name: "default".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_eviction_misses(mut self, misses: u32) -> Self {
        self.eviction_misses = misses.max(1);
        self
    }

    pub fn with_strict_models(mut self, strict: bool) -> Self {
        self.strict_models = strict;
        self
    }

    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.eviction_misses, 2);
        assert_eq!(config.default_name, "default");
        assert!(config.strict_models);
    }

    #[test]
    fn misses_never_drop_to_zero() {
        let config = EngineConfig::default().with_eviction_misses(0);
        assert_eq!(config.eviction_misses, 1);
    }
}
