//! OpenAI Codex CLI (`codex exec`).

use std::path::Path;
use std::sync::Arc;

use conductor_core::ndjson::{parse_line, str_at, u64_at};
use conductor_core::{BackendResponse, StreamEvent, TokenUsage};
use serde_json::Value;
use tracing::debug;

use super::{
    ApprovalMode, Backend, BackendError, BackendSettings, OutputFormat, OutputParser, TaskOptions,
    check_prompt, fold_events,
};
use crate::subprocess::CommandSpec;

pub struct CodexBackend {
    settings: BackendSettings,
}

impl CodexBackend {
    pub const NAME: &'static str = "codex";

    pub const fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl Backend for CodexBackend {
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

        let mut cmd = CommandSpec::new(&self.settings.binary).arg("exec");
        if options.output_format != OutputFormat::Text {
            cmd = cmd.arg("--json");
        }
        if let Some(model) = self.settings.model(options) {
            cmd = cmd.args(["--model", model]);
        }
        cmd = match options.approval {
            ApprovalMode::Default => cmd,
            ApprovalMode::ReadOnly => cmd.args(["--sandbox", "read-only"]),
            ApprovalMode::AutoEdit => cmd.arg("--full-auto"),
            ApprovalMode::FullAuto => cmd.arg("--dangerously-bypass-approvals-and-sandbox"),
        };
        if let Some(dir) = &options.work_dir {
            cmd = cmd
                .arg("--cd")
                .arg(dir.to_string_lossy())
                .current_dir(dir);
        }
        if let Some(tokens) = options.max_tokens {
            cmd = cmd
                .arg("--config")
                .arg(format!("model_max_output_tokens={tokens}"));
        }
        if options.max_turns.is_some() {
            debug!("codex has no turn limit flag, ignoring max_turns");
        }
        cmd = cmd.arg("--skip-git-repo-check");
        cmd = cmd.args(self.settings.extra_args(options));

        if let Some(session) = &options.resume_session {
            cmd = cmd.args(["resume", session.as_str()]);
        }
        Ok(cmd.arg(prompt))
    }

    fn parser(&self) -> Arc<dyn OutputParser> {
        Arc::new(CodexParser)
    }
}

/// Parses `codex exec --json` event lines.
pub struct CodexParser;

fn usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: u64_at(usage, &["input_tokens"]).unwrap_or(0),
        output_tokens: u64_at(usage, &["output_tokens"]).unwrap_or(0),
        cached_tokens: u64_at(usage, &["cached_input_tokens"]).unwrap_or(0),
        reasoning_tokens: u64_at(usage, &["reasoning_output_tokens"]).unwrap_or(0),
    })
}

impl OutputParser for CodexParser {
    fn parse_response(&self, raw: &str) -> BackendResponse {
        fold_events(self, raw)
    }

    fn parse_event(&self, line: &str) -> Option<StreamEvent> {
        let value = parse_line(line)?;
        match str_at(&value, &["type"])? {
            "thread.started" => Some(StreamEvent::Started {
                session_id: str_at(&value, &["thread_id"])?.to_string(),
            }),
            "item.completed" if str_at(&value, &["item", "type"]) == Some("agent_message") => {
                str_at(&value, &["item", "text"]).map(|t| StreamEvent::Text(t.to_string()))
            }
            "turn.completed" => Some(StreamEvent::Done {
                session_id: None,
                usage: usage(&value),
            }),
            "turn.failed" => Some(StreamEvent::Error(
                str_at(&value, &["error", "message"])
                    .unwrap_or("turn failed")
                    .to_string(),
            )),
            "error" => Some(StreamEvent::Error(
                str_at(&value, &["message"]).unwrap_or("error").to_string(),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend() -> CodexBackend {
        CodexBackend::new(BackendSettings::resolve("codex", None))
    }

    #[test]
    fn builds_exec_command() {
        let options = TaskOptions {
            model: Some("o3".into()),
            output_format: OutputFormat::Json,
            approval: ApprovalMode::ReadOnly,
            max_tokens: Some(2048),
            ..TaskOptions::default()
        };
        let cmd = backend().build_command("summarize", &options).unwrap();
        assert_eq!(
            cmd.args,
            [
                "exec",
                "--json",
                "--model",
                "o3",
                "--sandbox",
                "read-only",
                "--config",
                "model_max_output_tokens=2048",
                "--skip-git-repo-check",
                "summarize",
            ]
        );
    }

    #[test]
    fn resume_puts_subcommand_before_prompt() {
        let options = TaskOptions {
            resume_session: Some("thread-7".into()),
            ..TaskOptions::default()
        };
        let cmd = backend().build_command("continue", &options).unwrap();
        let tail: Vec<_> = cmd.args.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, ["resume", "thread-7", "continue"]);
    }

    #[test]
    fn system_prompt_is_unsupported() {
        let options = TaskOptions {
            system_prompt: Some("be terse".into()),
            ..TaskOptions::default()
        };
        assert!(matches!(
            backend().build_command("hi", &options),
            Err(BackendError::Unsupported { .. })
        ));
    }

    #[test]
    fn folds_event_stream_into_response() {
        let raw = [
            r#"{"type":"thread.started","thread_id":"th-1"}"#,
            r#"{"type":"turn.started"}"#,
            r#"{"type":"item.completed","item":{"id":"i0","type":"reasoning","text":"thinking"}}"#,
            r#"{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"All tests pass."}}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":100,"cached_input_tokens":40,"output_tokens":12}}"#,
        ]
        .join("\n");
        let response = CodexParser.parse_response(&raw);
        assert_eq!(response.session_id.as_deref(), Some("th-1"));
        assert_eq!(response.content, "All tests pass.");
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cached_tokens, 40);
        assert!(response.error.is_none());
    }

    #[test]
    fn failed_turn_is_an_error() {
        let line = r#"{"type":"turn.failed","error":{"message":"stream disconnected"}}"#;
        assert_eq!(
            CodexParser.parse_event(line),
            Some(StreamEvent::Error("stream disconnected".into()))
        );
    }

    #[test]
    fn text_output_falls_back_to_plain() {
        let response = CodexParser.parse_response("final answer\n");
        assert_eq!(response.content, "final answer");
    }
}
