//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use conductor_runner::backend::{ApprovalMode, OutputFormat, TaskOptions};

use crate::session_cmd::SessionAction;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about = "Run AI coding agents singly, in parallel, in chains or side by side", long_about = None)]
pub struct Cli {
    /// Log level for conductor crates (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn", env = "CONDUCTOR_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Extra config file layered over the global and project files
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print reports as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Per-subprocess timeout in seconds (0 disables)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one prompt against one backend
    Run {
        /// Backend to run (claude, codex, gemini)
        #[arg(short, long, default_value = "claude")]
        backend: String,
        #[command(flatten)]
        task: TaskArgs,
        #[command(flatten)]
        attach: AttachArgs,
        /// Prompt text
        prompt: String,
    },
    /// Continue a stored session
    Resume {
        /// Session ID (see `conductor sessions list`)
        #[arg(required_unless_present = "last")]
        session: Option<String>,
        /// Resume the most recently used session instead
        #[arg(long, conflicts_with = "session")]
        last: bool,
        #[command(flatten)]
        task: TaskArgs,
        #[command(flatten)]
        attach: AttachArgs,
        /// Follow-up prompt
        #[arg(short, long)]
        prompt: String,
    },
    /// Run a JSON task file under a bounded worker pool
    Parallel {
        /// Task file: a JSON array of tasks or {"tasks": [...]}
        #[arg(short, long)]
        file: PathBuf,
        /// Worker pool size (defaults to the configured value)
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,
        /// Cancel tasks that have not started once one fails
        #[arg(long)]
        fail_fast: bool,
    },
    /// Run a JSON step file sequentially, substituting {{previous}}
    Chain {
        /// Step file: a JSON array of steps or {"steps": [...]}
        #[arg(short, long)]
        file: PathBuf,
        /// Keep going after a failing step
        #[arg(long)]
        continue_on_failure: bool,
        /// Steps without a working directory inherit the previous step's
        #[arg(long)]
        pass_workdir: bool,
    },
    /// Run one prompt on several backends and compare the answers
    Compare {
        /// Backends to compare, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "claude,codex,gemini")]
        backends: Vec<String>,
        /// Run backends one after another
        #[arg(long)]
        sequential: bool,
        #[command(flatten)]
        task: TaskArgs,
        /// Prompt text
        prompt: String,
    },
    /// Inspect and maintain stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// List known backends and whether they are installed
    Backends,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalArg {
    Default,
    ReadOnly,
    AutoEdit,
    FullAuto,
}

impl From<ApprovalArg> for ApprovalMode {
    fn from(arg: ApprovalArg) -> Self {
        match arg {
            ApprovalArg::Default => Self::Default,
            ApprovalArg::ReadOnly => Self::ReadOnly,
            ApprovalArg::AutoEdit => Self::AutoEdit,
            ApprovalArg::FullAuto => Self::FullAuto,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatArg {
    Text,
    Json,
    StreamJson,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
            FormatArg::StreamJson => Self::StreamJson,
        }
    }
}

/// Options forwarded to the backend.
#[derive(Args, Debug, Clone, Default)]
pub struct TaskArgs {
    /// Model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Working directory for the agent
    #[arg(short = 'd', long)]
    pub work_dir: Option<PathBuf>,

    /// Approval policy
    #[arg(long, value_enum)]
    pub approval: Option<ApprovalArg>,

    /// Output format requested from the backend
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Maximum agent turns
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Maximum output tokens
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// System prompt to append
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Ask the backend for verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Extra argument passed to the backend verbatim (repeatable)
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,
}

impl TaskArgs {
    pub fn to_options(&self) -> TaskOptions {
        TaskOptions {
            work_dir: self.work_dir.clone(),
            model: self.model.clone(),
            approval: self.approval.map(Into::into).unwrap_or_default(),
            output_format: self.format.map(Into::into).unwrap_or_default(),
            max_tokens: self.max_tokens,
            max_turns: self.max_turns,
            system_prompt: self.system_prompt.clone(),
            verbose: self.verbose,
            resume_session: None,
            extra_args: self.extra_args.clone(),
        }
    }
}

/// How a single run is attached to this terminal.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct AttachArgs {
    /// Give the agent a pseudo-terminal connected to this one
    #[arg(long)]
    pub pty: bool,

    /// Echo raw streaming output as it arrives
    #[arg(long)]
    pub passthrough: bool,
}
