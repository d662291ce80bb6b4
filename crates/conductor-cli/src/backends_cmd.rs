//! `conductor backends`: installed backends at a glance.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use serde::Serialize;

use conductor_runner::backend::{BackendRegistry, find_executable};

#[derive(Debug, Serialize)]
struct BackendStatus {
    name: String,
    binary: String,
    /// Resolved executable path, when found.
    path: Option<String>,
}

fn collect(registry: &BackendRegistry) -> Vec<BackendStatus> {
    registry
        .iter()
        .map(|backend| BackendStatus {
            name: backend.name().to_string(),
            binary: backend.binary().display().to_string(),
            path: find_executable(backend.binary()).map(|p| p.display().to_string()),
        })
        .collect()
}

fn write_table(w: &mut impl Write, statuses: &[BackendStatus]) -> io::Result<()> {
    writeln!(w, "{:<10}  {:<10}  PATH", "BACKEND", "STATUS")?;
    for s in statuses {
        writeln!(
            w,
            "{:<10}  {:<10}  {}",
            s.name,
            if s.path.is_some() { "available" } else { "missing" },
            s.path.as_deref().unwrap_or(&s.binary),
        )?;
    }
    Ok(())
}

pub fn run(registry: &BackendRegistry, json: bool) -> anyhow::Result<()> {
    let statuses = collect(registry);
    let mut out = io::stdout();
    if json {
        crate::report_fmt::write_json(&mut out, &statuses)?;
    } else {
        write_table(&mut out, &statuses)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::Config;
    use conductor_core::config::BackendConfig;

    #[test]
    fn missing_binary_is_reported() {
        let mut config = Config::default();
        config.backends.insert(
            "gemini".into(),
            BackendConfig {
                binary: Some("/nonexistent/gemini".into()),
                ..BackendConfig::default()
            },
        );
        let statuses = collect(&BackendRegistry::with_defaults(&config));
        let gemini = statuses.iter().find(|s| s.name == "gemini").unwrap();
        assert!(gemini.path.is_none());

        let mut buf = Vec::new();
        write_table(&mut buf, &statuses).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("gemini      missing     /nonexistent/gemini"));
    }
}
