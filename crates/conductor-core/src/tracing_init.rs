//! Shared tracing/logging initialization.
//!
//! The `conductor` binary and the integration harnesses set up
//! `tracing_subscriber` the same way: an env-filter, stderr output and
//! optional JSON lines.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"conductor=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Logs always go to stderr; stdout is reserved for agent output.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the default filter string for a log level, covering all workspace crates.
pub fn default_filter(level: &str) -> String {
    format!("conductor={level},conductor_core={level},conductor_runner={level},conductor_cli={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter("debug");
        assert!(filter.contains("conductor_runner=debug"));
        assert!(filter.contains("conductor_cli=debug"));
        assert!(filter.starts_with("conductor=debug"));
    }
}
