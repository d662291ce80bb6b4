//! Multi-task subcommands: `parallel`, `chain` and `compare`.
//!
//! Each prints one line per task and a summary, then returns the aggregate
//! error so the process exits non-zero when anything failed.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io;
use std::path::Path;

use anyhow::Context as _;

use conductor_runner::orchestration::{
    ChainOptions, CompareOptions, ParallelOptions, TaskSpec, parse_task_file,
};

use crate::cli::TaskArgs;
use crate::report_fmt::{write_chain_report, write_compare_report, write_json, write_parallel_report};
use crate::setup::Context;

fn read_tasks(path: &Path) -> anyhow::Result<Vec<TaskSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    parse_task_file(&content).with_context(|| format!("Invalid task file {}", path.display()))
}

pub async fn parallel(
    ctx: &Context,
    file: &Path,
    max_parallel: Option<usize>,
    fail_fast: bool,
    json: bool,
) -> anyhow::Result<()> {
    let tasks = read_tasks(file)?;
    let options = ParallelOptions {
        max_parallel,
        fail_fast: fail_fast.then_some(true),
    };
    let report = ctx.orchestrator().run_parallel(tasks, options).await;

    let mut out = io::stdout();
    if json {
        write_json(&mut out, &report)?;
    } else {
        write_parallel_report(&mut out, &report)?;
    }
    Ok(report.ensure_success()?)
}

pub async fn chain(
    ctx: &Context,
    file: &Path,
    continue_on_failure: bool,
    pass_workdir: bool,
    json: bool,
) -> anyhow::Result<()> {
    let steps = read_tasks(file)?;
    let options = ChainOptions {
        stop_on_failure: !continue_on_failure,
        pass_workdir,
    };
    let report = ctx.orchestrator().run_chain(steps, options).await;

    let mut out = io::stdout();
    if json {
        write_json(&mut out, &report)?;
    } else {
        write_chain_report(&mut out, &report)?;
    }
    Ok(report.ensure_success()?)
}

pub async fn compare(
    ctx: &Context,
    backends: &[String],
    sequential: bool,
    task: &TaskArgs,
    prompt: &str,
    json: bool,
) -> anyhow::Result<()> {
    let report = ctx
        .orchestrator()
        .run_compare(
            prompt,
            backends,
            &task.to_options(),
            CompareOptions {
                parallel: !sequential,
            },
        )
        .await?;

    let mut out = io::stdout();
    if json {
        write_json(&mut out, &report)?;
    } else {
        write_compare_report(&mut out, &report)?;
    }
    Ok(report.ensure_success()?)
}
