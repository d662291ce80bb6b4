//! Backend CLIs: command construction and output parsing.
//!
//! Each supported agent implements [`Backend`], turning a prompt plus
//! [`TaskOptions`] into a [`CommandSpec`], and supplies an [`OutputParser`]
//! that maps its JSON or NDJSON output into the normalized core types.

mod claude;
mod codex;
mod gemini;
mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use conductor_core::config::BackendConfig;
use conductor_core::{BackendResponse, StreamEvent, TokenUsage};
use serde::{Deserialize, Serialize};

use crate::subprocess::CommandSpec;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use gemini::GeminiBackend;
pub use registry::BackendRegistry;

/// Maps a backend's raw output into normalized responses and events.
pub trait OutputParser: Send + Sync {
    /// Parse the complete captured output of a non-streaming run.
    fn parse_response(&self, raw: &str) -> BackendResponse;

    /// Parse one line of streaming output. Unrecognized lines yield `None`.
    fn parse_event(&self, line: &str) -> Option<StreamEvent>;
}

/// An external AI agent CLI.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Executable invoked for this backend.
    fn binary(&self) -> &Path;

    /// Whether the executable can be found.
    fn is_available(&self) -> bool {
        find_executable(self.binary()).is_some()
    }

    /// Build the command line for `prompt`.
    fn build_command(&self, prompt: &str, options: &TaskOptions)
    -> Result<CommandSpec, BackendError>;

    fn parser(&self) -> Arc<dyn OutputParser>;
}

/// Errors from backend lookup and command construction.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown backend: {0}")]
    Unknown(String),

    #[error("backend '{name}' is not available ({} not found on PATH)", binary.display())]
    Unavailable { name: String, binary: PathBuf },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("{backend} does not support {feature}")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },
}

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// The backend's own default.
    #[default]
    Default,
    /// No writes, planning only.
    ReadOnly,
    /// File edits allowed without prompting.
    AutoEdit,
    /// Everything allowed without prompting.
    FullAuto,
}

/// Output format requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

/// Per-invocation options shared by every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub approval: ApprovalMode,
    pub output_format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub verbose: bool,
    /// Backend-native session to continue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Configuration common to every built-in backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub binary: PathBuf,
    pub default_model: Option<String>,
    pub extra_args: Vec<String>,
}

impl BackendSettings {
    /// Settings for a backend whose executable is `default_binary` unless overridden.
    pub fn resolve(default_binary: &str, config: Option<&BackendConfig>) -> Self {
        Self {
            binary: config
                .and_then(|c| c.binary.clone())
                .unwrap_or_else(|| PathBuf::from(default_binary)),
            default_model: config.and_then(|c| c.default_model.clone()),
            extra_args: config.map(|c| c.extra_args.clone()).unwrap_or_default(),
        }
    }

    fn model<'a>(&'a self, options: &'a TaskOptions) -> Option<&'a str> {
        options.model.as_deref().or(self.default_model.as_deref())
    }

    /// Configured arguments followed by the task's own.
    fn extra_args<'a>(&'a self, options: &'a TaskOptions) -> impl Iterator<Item = &'a String> {
        self.extra_args.iter().chain(&options.extra_args)
    }
}

/// Locate `binary`: used as-is when it contains a path separator, searched on `PATH` otherwise.
pub fn find_executable(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return is_executable(binary).then(|| binary.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(binary);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            return is_executable(&exe).then_some(exe);
        }
        None
    })
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

fn check_prompt(prompt: &str) -> Result<(), BackendError> {
    if prompt.trim().is_empty() {
        Err(BackendError::EmptyPrompt)
    } else {
        Ok(())
    }
}

/// Build a response by replaying every output line through `parse_event`.
///
/// Used for backends whose "JSON" output is really an event stream.
pub(crate) fn fold_events(parser: &dyn OutputParser, raw: &str) -> BackendResponse {
    let mut response = BackendResponse::default();
    let mut saw_event = false;
    for event in raw.lines().filter_map(|line| parser.parse_event(line)) {
        saw_event = true;
        match event {
            StreamEvent::Started { session_id } => response.session_id = Some(session_id),
            StreamEvent::Text(text) => {
                if !response.content.is_empty() {
                    response.content.push('\n');
                }
                response.content.push_str(&text);
            }
            StreamEvent::Done { session_id, usage } => {
                if session_id.is_some() {
                    response.session_id = session_id;
                }
                if let Some(usage) = usage {
                    response.usage.get_or_insert_with(TokenUsage::default).add(&usage);
                }
            }
            StreamEvent::Error(message) => response.error = Some(message),
        }
    }
    if saw_event {
        response
    } else {
        BackendResponse::plain(raw.trim())
    }
}
