//! Configuration resolution for Conductor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/conductor/config.toml`)
//! 3. Project config (`.conductor/config.toml`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are merged table by table, so a project file that only sets
//! `orchestration.max_parallel` keeps every other inherited value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Per-backend overrides keyed by backend name.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

/// Defaults consumed by the task orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Worker pool size for parallel runs.
    pub max_parallel: usize,
    /// Whether one failing task cancels not-yet-started peers.
    pub fail_fast: bool,
    /// Per-subprocess timeout in seconds (0 = no timeout).
    pub command_timeout_secs: u64,
    /// Seconds between a forwarded SIGTERM and the SIGKILL escalation.
    pub grace_period_secs: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            fail_fast: false,
            command_timeout_secs: 600,
            grace_period_secs: 5,
        }
    }
}

impl OrchestrationConfig {
    /// Per-subprocess timeout, `None` when disabled.
    pub const fn command_timeout(&self) -> Option<Duration> {
        if self.command_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.command_timeout_secs))
        }
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding session files. Defaults to `~/.conductor/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Sessions unused for longer than this are removed by `clean`.
    pub retention_days: u64,
    /// Upper bound on waiting for a session file lock.
    pub lock_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: None,
            retention_days: 30,
            lock_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Resolved session directory.
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        self.directory.clone().or_else(default_session_dir)
    }
}

/// Circuit breaker thresholds shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Seconds to stay open before probing.
    pub open_timeout_secs: u64,
    /// Concurrent probe calls allowed while half-open.
    pub max_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 30,
            max_half_open: 1,
        }
    }
}

/// Per-backend overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable to run instead of the backend's default binary name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Model used when a task does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` names a file layered over the project config (the `--config`
/// flag); unlike the implicit layers it must exist.
pub fn load_config(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        layers.push(global_path);
    }
    if let Some(dir) = project_dir {
        layers.push(dir.join(".conductor").join("config.toml"));
    }
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        layers.push(path.to_path_buf());
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merge the given config files over the defaults. Missing files are skipped.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = toml::Value::try_from(Config::default())
        .map_err(|e| Error::Config(format!("Failed to encode defaults: {e}")))?;

    for path in paths {
        if !path.exists() {
            continue;
        }
        let overlay = load_config_file(path)?;
        merge_values(&mut merged, overlay);
    }

    merged
        .try_into()
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conductor").join("config.toml"))
}

/// Default directory for session files: `~/.conductor/sessions`.
pub fn default_session_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor").join("sessions"))
}

fn load_config_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CONDUCTOR_MAX_PARALLEL")
        && let Ok(n) = val.parse()
    {
        config.orchestration.max_parallel = n;
    }
    if let Ok(val) = std::env::var("CONDUCTOR_FAIL_FAST") {
        config.orchestration.fail_fast = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("CONDUCTOR_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.orchestration.command_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("CONDUCTOR_SESSION_DIR") {
        config.sessions.directory = Some(PathBuf::from(val));
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_workers() {
        let config = Config::default();
        assert_eq!(config.orchestration.max_parallel, 3);
        assert!(!config.orchestration.fail_fast);
        assert_eq!(config.orchestration.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = OrchestrationConfig {
            command_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.command_timeout().is_none());
    }

    #[test]
    fn project_layer_overrides_single_field() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &global,
            "[orchestration]\nmax_parallel = 8\nfail_fast = true\n\n[sessions]\nretention_days = 7\n",
        )
        .unwrap();
        std::fs::write(&project, "[orchestration]\nmax_parallel = 2\n").unwrap();

        let config = load_layers(&[global, project]).unwrap();
        assert_eq!(config.orchestration.max_parallel, 2);
        assert!(config.orchestration.fail_fast);
        assert_eq!(config.sessions.retention_days, 7);
        assert_eq!(config.breaker, BreakerConfig::default());
    }

    #[test]
    fn explicit_config_must_exist() {
        let err = load_config(None, Some(Path::new("/nonexistent/explicit.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn missing_layers_yield_defaults() {
        let config = load_layers(&[PathBuf::from("/nonexistent/conductor.toml")]).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn backend_overrides_are_parsed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[backends.claude]\nbinary = \"/opt/claude\"\nextra_args = [\"--verbose\"]\n",
        )
        .unwrap();

        let config = load_layers(&[path]).unwrap();
        let claude = config.backends.get("claude").unwrap();
        assert_eq!(claude.binary.as_deref(), Some(Path::new("/opt/claude")));
        assert_eq!(claude.extra_args, vec!["--verbose"]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[orchestration\nmax_parallel = ").unwrap();
        assert!(matches!(load_layers(&[path]), Err(Error::Config(_))));
    }
}
