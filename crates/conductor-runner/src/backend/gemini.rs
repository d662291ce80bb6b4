//! Google Gemini CLI (`gemini -p`).

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

pub struct GeminiBackend {
    settings: BackendSettings,
}

impl GeminiBackend {
    pub const NAME: &'static str = "gemini";

    pub const fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl Backend for GeminiBackend {
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
        if options.system_prompt.is_some() {
            return Err(BackendError::Unsupported {
                backend: Self::NAME,
                feature: "system prompts",
            });
        }

        let mut cmd = CommandSpec::new(&self.settings.binary);
        cmd = match options.output_format {
            OutputFormat::Text => cmd,
            OutputFormat::Json => cmd.args(["--output-format", "json"]),
            OutputFormat::StreamJson => cmd.args(["--output-format", "stream-json"]),
        };
        if let Some(model) = self.settings.model(options) {
            cmd = cmd.args(["--model", model]);
        }
        cmd = match options.approval {
            ApprovalMode::Default => cmd,
            ApprovalMode::ReadOnly => cmd.args(["--approval-mode", "default", "--sandbox"]),
            ApprovalMode::AutoEdit => cmd.args(["--approval-mode", "auto_edit"]),
            ApprovalMode::FullAuto => cmd.arg("--yolo"),
        };
        if options.verbose {
            cmd = cmd.arg("--debug");
        }
        if let Some(session) = &options.resume_session {
            cmd = cmd.args(["--resume", session.as_str()]);
        }
        if options.max_tokens.is_some() || options.max_turns.is_some() {
            debug!("gemini has no token or turn limit flags, ignoring");
        }
        cmd = cmd.args(self.settings.extra_args(options));
        if let Some(dir) = &options.work_dir {
            cmd = cmd.current_dir(dir);
        }
        Ok(cmd.arg("--prompt").arg(prompt))
    }

    fn parser(&self) -> Arc<dyn OutputParser> {
        Arc::new(GeminiParser)
    }
}

/// Parses `--output-format json` documents and `stream-json` events.
pub struct GeminiParser;

/// Sum token counts over every model listed under `stats.models`.
fn model_usage(stats: &Value) -> Option<TokenUsage> {
    let models = stats.get("models")?.as_object()?;
    let mut total = TokenUsage::default();
    for model in models.values() {
        let tokens = model.get("tokens").unwrap_or(model);
        total.add(&TokenUsage {
            input_tokens: u64_at(tokens, &["prompt"]).unwrap_or(0),
            output_tokens: u64_at(tokens, &["candidates"]).unwrap_or(0),
            cached_tokens: u64_at(tokens, &["cached"]).unwrap_or(0),
            reasoning_tokens: u64_at(tokens, &["thoughts"]).unwrap_or(0),
        });
    }
    Some(total)
}

fn flat_usage(stats: &Value) -> Option<TokenUsage> {
    let input = u64_at(stats, &["input_tokens"]);
    let output = u64_at(stats, &["output_tokens"]);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cached_tokens: u64_at(stats, &["cached"]).unwrap_or(0),
        reasoning_tokens: 0,
    })
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    Some(
        error
            .as_str()
            .or_else(|| str_at(error, &["message"]))
            .unwrap_or("unknown error")
            .to_string(),
    )
}

impl OutputParser for GeminiParser {
    fn parse_response(&self, raw: &str) -> BackendResponse {
        let Ok(doc) = parse_document(raw) else {
            return BackendResponse::plain(raw.trim());
        };
        BackendResponse {
            session_id: str_at(&doc, &["session_id"]).map(String::from),
            content: str_at(&doc, &["response"]).unwrap_or_default().to_string(),
            usage: doc.get("stats").and_then(model_usage),
            error: error_message(&doc),
        }
    }

    fn parse_event(&self, line: &str) -> Option<StreamEvent> {
        let value = parse_line(line)?;
        match str_at(&value, &["type"])? {
            "init" => Some(StreamEvent::Started {
                session_id: str_at(&value, &["session_id"])?.to_string(),
            }),
            "message" if str_at(&value, &["role"]) == Some("assistant") => {
                str_at(&value, &["content"]).map(|t| StreamEvent::Text(t.to_string()))
            }
            "result" => match error_message(&value) {
                Some(message) => Some(StreamEvent::Error(message)),
                None => Some(StreamEvent::Done {
                    session_id: str_at(&value, &["session_id"]).map(String::from),
                    usage: value
                        .get("stats")
                        .and_then(|s| flat_usage(s).or_else(|| model_usage(s))),
                }),
            },
            "error" => Some(StreamEvent::Error(
                str_at(&value, &["message"]).unwrap_or("error").to_string(),
            )),
            _ => None,
        }
    }
}
