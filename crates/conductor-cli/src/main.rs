//! Conductor CLI
//!
//! Runs AI coding agents as subprocesses: one at a time, in bounded parallel
//! batches, in chains that feed each output into the next prompt, or side by
//! side for comparison.

use clap::Parser;
use tracing::{info, warn};

use conductor_cli::cli::{Cli, Command};
use conductor_cli::setup::Context;
use conductor_cli::{backends_cmd, batch_cmd, run_cmd, session_cmd};
use conductor_core::tracing_init::{default_filter, init_tracing};
use conductor_runner::backend::BackendRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&default_filter(&cli.log_level), cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting conductor");

    let ctx = Context::load(&cli)?;

    // A signal that arrives while no agent is running ends conductor here;
    // during a run it is forwarded to the agent and the run winds down.
    let interrupt = ctx.interrupt.clone();
    tokio::spawn(async move {
        if let Some(code) = interrupt.listen().await {
            warn!(code, "Interrupted while idle, exiting");
            std::process::exit(code);
        }
    });

    let result = dispatch(cli, &ctx).await;
    if let Some(code) = ctx.interrupt.exit_code() {
        if let Err(e) = &result {
            warn!(error = %e, "Run interrupted");
        }
        std::process::exit(code);
    }
    result
}

async fn dispatch(cli: Cli, ctx: &Context) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Command::Run {
            backend,
            task,
            attach,
            prompt,
        } => run_cmd::run(ctx, &backend, &task, attach, &prompt, json).await,
        Command::Resume {
            session,
            last,
            task,
            attach,
            prompt,
        } => run_cmd::resume(ctx, session.as_deref(), last, &task, attach, &prompt, json).await,
        Command::Parallel {
            file,
            max_parallel,
            fail_fast,
        } => batch_cmd::parallel(ctx, &file, max_parallel, fail_fast, json).await,
        Command::Chain {
            file,
            continue_on_failure,
            pass_workdir,
        } => batch_cmd::chain(ctx, &file, continue_on_failure, pass_workdir, json).await,
        Command::Compare {
            backends,
            sequential,
            task,
            prompt,
        } => batch_cmd::compare(ctx, &backends, sequential, &task, &prompt, json).await,
        Command::Sessions { action } => {
            let store = ctx.store()?;
            session_cmd::run(&store, ctx.config.sessions.retention(), action, json)
        }
        Command::Backends => backends_cmd::run(&BackendRegistry::with_defaults(&ctx.config), json),
    }
}
