//! Single-run subcommands: `run` and `resume`.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, IsTerminal as _, Write};

use anyhow::bail;

use conductor_runner::backend::TaskOptions;
use conductor_runner::orchestration::{SingleRunMode, SingleRunOutcome};
use conductor_runner::subprocess::TerminalMode;

use crate::cli::{AttachArgs, TaskArgs};
use crate::report_fmt::{write_json, write_single_footer};
use crate::setup::Context;

fn mode(attach: AttachArgs) -> SingleRunMode {
    SingleRunMode {
        terminal: if attach.pty {
            TerminalMode::Pty
        } else {
            TerminalMode::Pipe
        },
        passthrough: attach.passthrough,
    }
}

pub async fn run(
    ctx: &Context,
    backend: &str,
    task: &TaskArgs,
    attach: AttachArgs,
    prompt: &str,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator = ctx.orchestrator();
    let backend = orchestrator.backends().require(backend)?;
    let outcome = orchestrator
        .run_single(backend, prompt, &task.to_options(), mode(attach))
        .await?;
    report(&outcome, attach, json)
}

/// Resume `session`, or the most recently used one when `last` is set.
pub async fn resume(
    ctx: &Context,
    session: Option<&str>,
    last: bool,
    task: &TaskArgs,
    attach: AttachArgs,
    prompt: &str,
    json: bool,
) -> anyhow::Result<()> {
    let id = match (session, last) {
        (Some(id), false) => id.to_string(),
        (None, true) => match ctx.store()?.latest(None)? {
            Some(session) => session.id,
            None => bail!("No sessions to resume"),
        },
        (Some(_), true) => bail!("Pass either a session ID or --last, not both"),
        (None, false) => bail!("A session ID or --last is required"),
    };

    let options: TaskOptions = task.to_options();
    let outcome = ctx
        .orchestrator()
        .resume(&id, prompt, &options, mode(attach))
        .await?;
    report(&outcome, attach, json)
}

fn report(outcome: &SingleRunOutcome, attach: AttachArgs, json: bool) -> anyhow::Result<()> {
    let mut out = io::stdout();
    if json {
        write_json(&mut out, outcome)?;
    } else {
        // A PTY or passthrough run has already shown the agent's output.
        if !attach.pty && !attach.passthrough && !outcome.content.is_empty() {
            writeln!(out, "{}", outcome.content)?;
        }
        if io::stderr().is_terminal() {
            write_single_footer(&mut io::stderr(), outcome)?;
        }
    }

    if outcome.is_success() {
        Ok(())
    } else {
        bail!(
            "{} failed: {}",
            outcome.backend,
            outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", outcome.exit_code))
        )
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::Config;
    use conductor_runner::subprocess::Interrupt;

    fn context(dir: &std::path::Path) -> Context {
        let mut config = Config::default();
        config.sessions.directory = Some(dir.to_path_buf());
        Context {
            config,
            interrupt: Interrupt::new(),
        }
    }

    #[tokio::test]
    async fn last_with_empty_store_has_nothing_to_resume() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let err = resume(
            &ctx,
            None,
            true,
            &TaskArgs::default(),
            AttachArgs::default(),
            "more",
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "No sessions to resume");
    }

    #[tokio::test]
    async fn resume_needs_exactly_one_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let task = TaskArgs::default();
        let neither = resume(&ctx, None, false, &task, AttachArgs::default(), "p", false)
            .await
            .unwrap_err();
        assert!(neither.to_string().contains("--last"));
        let both = resume(&ctx, Some("abc"), true, &task, AttachArgs::default(), "p", false)
            .await
            .unwrap_err();
        assert!(both.to_string().contains("not both"));
    }
}
