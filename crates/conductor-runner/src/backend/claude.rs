//! Claude Code (`claude -p`).

use std::path::Path;
use std::sync::Arc;

use conductor_core::ndjson::{parse_document, parse_line, str_at, u64_at};
use conductor_core::{BackendResponse, StreamEvent, TokenUsage};
use serde_json::Value;
use tracing::debug;

use super::{
    ApprovalMode, Backend, BackendError, BackendSettings, OutputFormat, OutputParser, TaskOptions,
    check_prompt,
};
use crate::subprocess::CommandSpec;

pub struct ClaudeBackend {
    settings: BackendSettings,
}

impl ClaudeBackend {
    pub const NAME: &'static str = "claude";

    pub const fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn binary(&self) -> &Path {
        &self.settings.binary
    }

    fn build_command(
        &self,
        prompt: &str,
        options: &TaskOptions,
    ) -> Result<CommandSpec, BackendError> {
        check_prompt(prompt)?;

        let mut cmd = CommandSpec::new(&self.settings.binary).arg("-p").arg(prompt);
        cmd = match options.output_format {
            OutputFormat::Text => cmd.args(["--output-format", "text"]),
            OutputFormat::Json => cmd.args(["--output-format", "json"]),
            // Streaming JSON in print mode is only emitted with --verbose.
            OutputFormat::StreamJson => cmd.args(["--output-format", "stream-json", "--verbose"]),
        };
        if options.verbose && options.output_format != OutputFormat::StreamJson {
            cmd = cmd.arg("--verbose");
        }
        if let Some(model) = self.settings.model(options) {
            cmd = cmd.args(["--model", model]);
        }
        if let Some(turns) = options.max_turns {
            cmd = cmd.arg("--max-turns").arg(turns.to_string());
        }
        if let Some(system) = &options.system_prompt {
            cmd = cmd.arg("--append-system-prompt").arg(system);
        }
        if let Some(session) = &options.resume_session {
            cmd = cmd.args(["--resume", session.as_str()]);
        }
        cmd = match options.approval {
            ApprovalMode::Default => cmd,
            ApprovalMode::ReadOnly => cmd.args(["--permission-mode", "plan"]),
            ApprovalMode::AutoEdit => cmd.args(["--permission-mode", "acceptEdits"]),
            ApprovalMode::FullAuto => cmd.arg("--dangerously-skip-permissions"),
        };
        if options.max_tokens.is_some() {
            debug!("claude has no output token limit flag, ignoring max_tokens");
        }
        cmd = cmd.args(self.settings.extra_args(options));
        if let Some(dir) = &options.work_dir {
            cmd = cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    fn parser(&self) -> Arc<dyn OutputParser> {
        Arc::new(ClaudeParser)
    }
}

/// Parses `--output-format json` results and `stream-json` events.
pub struct ClaudeParser;

fn usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: u64_at(usage, &["input_tokens"]).unwrap_or(0)
            + u64_at(usage, &["cache_creation_input_tokens"]).unwrap_or(0),
        output_tokens: u64_at(usage, &["output_tokens"]).unwrap_or(0),
        cached_tokens: u64_at(usage, &["cache_read_input_tokens"]).unwrap_or(0),
        reasoning_tokens: 0,
    })
}

fn is_error(value: &Value) -> bool {
    value.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || str_at(value, &["subtype"]).is_some_and(|s| s.starts_with("error"))
}

fn assistant_text(value: &Value) -> Option<String> {
    let blocks = value.get("message")?.get("content")?.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| str_at(b, &["type"]) == Some("text"))
        .filter_map(|b| str_at(b, &["text"]))
        .collect();
    (!text.is_empty()).then(|| text.join(""))
}

impl OutputParser for ClaudeParser {
    fn parse_response(&self, raw: &str) -> BackendResponse {
        let Ok(doc) = parse_document(raw) else {
            return BackendResponse::plain(raw.trim());
        };
        let content = str_at(&doc, &["result"]).unwrap_or_default().to_string();
        let error = is_error(&doc).then(|| {
            if content.is_empty() {
                str_at(&doc, &["subtype"]).unwrap_or("error").to_string()
            } else {
                content.clone()
            }
        });
        BackendResponse {
            session_id: str_at(&doc, &["session_id"]).map(String::from),
            content,
            usage: usage(&doc),
            error,
        }
    }

    fn parse_event(&self, line: &str) -> Option<StreamEvent> {
        let value = parse_line(line)?;
        match str_at(&value, &["type"])? {
            "system" if str_at(&value, &["subtype"]) == Some("init") => {
                Some(StreamEvent::Started {
                    session_id: str_at(&value, &["session_id"])?.to_string(),
                })
            }
            "assistant" => assistant_text(&value).map(StreamEvent::Text),
            "result" if is_error(&value) => Some(StreamEvent::Error(
                str_at(&value, &["result"])
                    .or_else(|| str_at(&value, &["subtype"]))
                    .unwrap_or("error")
                    .to_string(),
            )),
            "result" => Some(StreamEvent::Done {
                session_id: str_at(&value, &["session_id"]).map(String::from),
                usage: usage(&value),
            }),
            _ => None,
        }
    }
}
