//! Name-keyed set of configured backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use conductor_core::Config;

use super::{
    Backend, BackendError, BackendSettings, ClaudeBackend, CodexBackend, GeminiBackend,
};

/// Backends available to the orchestrator, keyed by name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in backends, with binaries and defaults taken from `config`.
    pub fn with_defaults(config: &Config) -> Self {
        let settings = |name: &str| BackendSettings::resolve(name, config.backends.get(name));
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeBackend::new(settings(ClaudeBackend::NAME))));
        registry.register(Arc::new(CodexBackend::new(settings(CodexBackend::NAME))));
        registry.register(Arc::new(GeminiBackend::new(settings(GeminiBackend::NAME))));
        registry
    }

    /// Add or replace a backend.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    /// Like [`Self::get`], with an error naming the unknown backend.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self.get(name)
            .ok_or_else(|| BackendError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::config::BackendConfig;
    use std::path::Path;

    #[test]
    fn defaults_register_builtins() {
        let registry = BackendRegistry::with_defaults(&Config::default());
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, ["claude", "codex", "gemini"]);
        assert!(matches!(
            registry.require("cursor"),
            Err(BackendError::Unknown(name)) if name == "cursor"
        ));
    }

    #[test]
    fn binary_override_from_config() {
        let mut config = Config::default();
        config.backends.insert(
            "codex".into(),
            BackendConfig {
                binary: Some("/usr/local/bin/codex-nightly".into()),
                ..BackendConfig::default()
            },
        );
        let registry = BackendRegistry::with_defaults(&config);
        let codex = registry.get("codex").unwrap();
        assert_eq!(codex.binary(), Path::new("/usr/local/bin/codex-nightly"));
        assert!(!codex.is_available());
    }
}
