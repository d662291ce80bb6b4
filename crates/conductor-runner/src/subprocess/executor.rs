//! Run one backend subprocess to completion.
//!
//! [`ProcessExecutor::execute`] takes a fully built [`CommandSpec`] and an
//! I/O policy and always returns an [`ExecOutcome`]: failures to start, wait
//! or finish in time are folded into the exit code and error rather than
//! propagated.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{StreamEvent, TokenUsage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::OutputParser;

use super::signals::{Interrupt, SignalForwarder};

/// Exit code reported when the per-call timeout fires.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code of a task that was canceled before it ran.
pub const EXIT_CANCELED: i32 = -1;

/// Exit code for failures to start or wait on the child.
pub const EXIT_FAILURE: i32 = 1;

/// How long reader tasks may keep draining after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A ready-to-run external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Shell-like rendering, used for dry runs and logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// What to do with the child's standard output.
#[derive(Clone, Default)]
pub enum OutputMode {
    /// Capture as plain text.
    #[default]
    Text,
    /// Capture and parse as the backend's structured response.
    Json(Arc<dyn OutputParser>),
    /// Read line by line, optionally echoing, feeding the incremental parser.
    Stream {
        parser: Arc<dyn OutputParser>,
        passthrough: bool,
    },
}

impl fmt::Debug for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Json(_) => f.write_str("Json"),
            Self::Stream { passthrough, .. } => f
                .debug_struct("Stream")
                .field("passthrough", passthrough)
                .finish_non_exhaustive(),
        }
    }
}

/// How the child is attached to the caller's terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminalMode {
    /// Plain pipes, output captured.
    #[default]
    Pipe,
    /// Pseudo-terminal, output streamed to the caller's stdout and captured.
    Pty,
}

/// One executor call.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: CommandSpec,
    pub output: OutputMode,
    pub terminal: TerminalMode,
    /// Kill the child once this much time has passed.
    pub timeout: Option<Duration>,
    /// Relay the caller's SIGINT/SIGTERM/SIGQUIT to the child.
    pub forward_signals: bool,
    /// Raised by forwarded signals; a child started after it was raised is
    /// terminated at once.
    pub interrupt: Option<Interrupt>,
}

impl ExecRequest {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            output: OutputMode::Text,
            terminal: TerminalMode::Pipe,
            timeout: None,
            forward_signals: false,
            interrupt: None,
        }
    }

    #[must_use]
    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub const fn terminal(mut self, terminal: TerminalMode) -> Self {
        self.terminal = terminal;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn forward_signals(mut self, forward: bool) -> Self {
        self.forward_signals = forward;
        self
    }

    #[must_use]
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub(crate) fn forwarder(&self, pid: Option<u32>, grace: Duration) -> Option<SignalForwarder> {
        match (self.forward_signals, pid) {
            (true, Some(pid)) => Some(SignalForwarder::spawn(
                pid,
                grace,
                self.interrupt.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }
}

/// Why an execution did not succeed cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("killed after interrupt")]
    Killed,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("pseudo-terminal error: {0}")]
    Pty(String),
}

/// Result of one execution.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// Captured standard output (terminal escapes removed in PTY mode).
    pub output: String,
    pub stderr: String,
    /// Normalized assistant text.
    pub content: String,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<ExecError>,
}

impl ExecOutcome {
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    pub(crate) fn failed(error: ExecError) -> Self {
        Self {
            exit_code: EXIT_FAILURE,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Human-readable failure summary, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.to_string());
        }
        if self.exit_code == 0 {
            return None;
        }
        let detail = self.stderr.trim().lines().last().unwrap_or_default();
        if detail.is_empty() {
            Some(format!("exit code {}", self.exit_code))
        } else {
            Some(format!("exit code {}: {detail}", self.exit_code))
        }
    }
}

/// Incremental view of a streaming backend's output.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
    pub text: String,
}

impl StreamState {
    pub(crate) fn observe(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Started { session_id } => self.session_id = Some(session_id),
            StreamEvent::Text(text) => {
                if !self.text.is_empty() && !self.text.ends_with('\n') {
                    self.text.push('\n');
                }
                self.text.push_str(&text);
            }
            StreamEvent::Done { session_id, usage } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if let Some(usage) = usage {
                    self.usage.get_or_insert_with(TokenUsage::default).add(&usage);
                }
            }
            StreamEvent::Error(message) => self.error = Some(message),
        }
    }
}

/// How the wait on a child ended.
pub(crate) enum Waited<S> {
    Exited(S),
    TimedOut,
    Killed,
}

/// Runs subprocesses with the PTY or pipe strategy.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    grace_period: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessExecutor {
    pub const fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub const fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run the request to completion.
    pub async fn execute(&self, request: ExecRequest) -> ExecOutcome {
        info!(
            program = %request.command.program.display(),
            args = request.command.args.len(),
            terminal = ?request.terminal,
            output = ?request.output,
            timeout = ?request.timeout,
            "Executing subprocess"
        );

        let mut outcome = match request.terminal {
            TerminalMode::Pty => match super::pty::run(self, &request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "PTY unavailable, falling back to pipes");
                    self.run_piped(&request).await
                }
            },
            TerminalMode::Pipe => self.run_piped(&request).await,
        };

        // A backend that reports an error but exits cleanly still failed.
        if outcome.exit_code == 0 && outcome.error.is_some() {
            outcome.exit_code = EXIT_FAILURE;
        }

        debug!(
            exit_code = outcome.exit_code,
            output_bytes = outcome.output.len(),
            session_id = ?outcome.session_id,
            "Subprocess finished"
        );
        outcome
    }

    async fn run_piped(&self, request: &ExecRequest) -> ExecOutcome {
        let spec = &request.command;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so signals and kills reach the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                return ExecOutcome::failed(ExecError::Spawn {
                    program: spec.program.display().to_string(),
                    source,
                });
            }
        };
        let pid = child.id();
        debug!(?pid, "Subprocess spawned");

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_stdout(stdout, request.output.clone())));
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_all(stderr)));

        let forwarder = request.forwarder(pid, self.grace_period);
        let kill_switch = forwarder.as_ref().map(SignalForwarder::kill_switch);

        let waited = wait_child(&mut child, request.timeout, kill_switch).await;

        if let Some(forwarder) = forwarder {
            forwarder.stop().await;
        }

        let captured = match stdout_task {
            Some(task) => drain(task).await.unwrap_or_default(),
            None => Captured::default(),
        };
        let stderr = match stderr_task {
            Some(task) => drain(task).await.unwrap_or_default(),
            None => String::new(),
        };

        let mut outcome = match waited {
            Waited::Exited(Ok(status)) => ExecOutcome {
                exit_code: exit_code(status),
                ..ExecOutcome::default()
            },
            Waited::Exited(Err(e)) => ExecOutcome::failed(ExecError::Wait(e)),
            Waited::TimedOut => timed_out(request.timeout),
            Waited::Killed => ExecOutcome {
                exit_code: EXIT_FAILURE,
                error: Some(ExecError::Killed),
                ..ExecOutcome::default()
            },
        };
        outcome.stderr = stderr;
        interpret(&mut outcome, &request.output, captured);
        outcome
    }
}

/// Wait for the child, enforcing the timeout and honouring the kill switch.
async fn wait_child(
    child: &mut Child,
    timeout: Option<Duration>,
    kill_switch: Option<tokio_util::sync::CancellationToken>,
) -> Waited<std::io::Result<ExitStatus>> {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    let killed = async {
        match &kill_switch {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let waited = tokio::select! {
        status = child.wait() => return Waited::Exited(status),
        () = deadline => Waited::TimedOut,
        () = killed => Waited::Killed,
    };

    if matches!(waited, Waited::TimedOut) {
        warn!(pid = ?child.id(), ?timeout, "Subprocess timed out, killing");
    }
    kill_child(child);
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed subprocess");
    }
    waited
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        super::signals::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill failed, child likely gone");
    }
}

pub(crate) fn timed_out(timeout: Option<Duration>) -> ExecOutcome {
    ExecOutcome {
        exit_code: EXIT_TIMEOUT,
        error: Some(ExecError::TimedOut(timeout.unwrap_or_default())),
        ..ExecOutcome::default()
    }
}

/// Real exit code, or `128 + signal` for a signal death.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_FAILURE
}

/// Stdout as collected by the reader task.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub text: String,
    /// Present in stream mode: what the incremental parser saw.
    pub stream: Option<StreamState>,
}

async fn read_stdout(stdout: impl AsyncRead + Unpin, mode: OutputMode) -> Captured {
    let OutputMode::Stream {
        parser,
        passthrough,
    } = mode
    else {
        return Captured {
            text: read_all(stdout).await,
            stream: None,
        };
    };

    let mut reader = BufReader::new(stdout);
    let mut echo = passthrough.then(tokio::io::stdout);
    let mut state = StreamState::default();
    let mut text = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&line);
                if let Some(out) = &mut echo
                    && let Err(e) = echo_line(out, decoded.as_bytes()).await
                {
                    debug!(error = %e, "Passthrough stopped, stdout not writable");
                    echo = None;
                }
                if let Some(event) = parser.parse_event(&decoded) {
                    state.observe(event);
                }
                text.push_str(&decoded);
            }
            Err(e) => {
                warn!(error = %e, "Error reading subprocess stdout");
                break;
            }
        }
    }
    Captured {
        text,
        stream: Some(state),
    }
}

async fn echo_line(out: &mut tokio::io::Stdout, line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.flush().await
}

async fn read_all(mut stream: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        debug!(error = %e, "Error draining subprocess stream");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Join a reader task, abandoning it if grandchildren keep the pipe open.
async fn drain<T>(task: JoinHandle<T>) -> Option<T> {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(error = %e, "Reader task failed");
            None
        }
        Err(_) => {
            warn!("Reader still busy after child exit, abandoning");
            abort.abort();
            None
        }
    }
}

/// Fill content/session/usage/error from captured stdout according to the mode.
pub(crate) fn interpret(outcome: &mut ExecOutcome, mode: &OutputMode, captured: Captured) {
    match mode {
        OutputMode::Text => {
            outcome.content = captured.text.trim_end().to_string();
        }
        OutputMode::Json(parser) => {
            let response = parser.parse_response(&captured.text);
            outcome.content = response.content;
            outcome.session_id = response.session_id;
            outcome.usage = response.usage;
            if let Some(error) = response.error
                && outcome.error.is_none()
            {
                outcome.error = Some(ExecError::Backend(error));
            }
        }
        OutputMode::Stream { parser, .. } => {
            let state = captured.stream.unwrap_or_else(|| {
                let mut state = StreamState::default();
                captured
                    .text
                    .lines()
                    .filter_map(|line| parser.parse_event(line))
                    .for_each(|event| state.observe(event));
                state
            });
            outcome.content = state.text;
            outcome.session_id = state.session_id;
            outcome.usage = state.usage;
            if let Some(error) = state.error
                && outcome.error.is_none()
            {
                outcome.error = Some(ExecError::Backend(error));
            }
        }
    }
    outcome.output = captured.text;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::BackendResponse;

    /// Treats `{"text":..}` lines as text and `{"done":..}` as completion.
    struct LineParser;

    impl OutputParser for LineParser {
        fn parse_response(&self, raw: &str) -> BackendResponse {
            let Ok(doc) = conductor_core::ndjson::parse_document(raw) else {
                return BackendResponse::plain(raw.trim());
            };
            BackendResponse {
                session_id: conductor_core::ndjson::str_at(&doc, &["sid"]).map(String::from),
                content: conductor_core::ndjson::str_at(&doc, &["text"])
                    .unwrap_or_default()
                    .to_string(),
                usage: None,
                error: conductor_core::ndjson::str_at(&doc, &["error"]).map(String::from),
            }
        }

        fn parse_event(&self, line: &str) -> Option<StreamEvent> {
            let doc = conductor_core::ndjson::parse_line(line)?;
            if let Some(text) = conductor_core::ndjson::str_at(&doc, &["text"]) {
                return Some(StreamEvent::Text(text.to_string()));
            }
            if let Some(sid) = conductor_core::ndjson::str_at(&doc, &["done"]) {
                return Some(StreamEvent::Done {
                    session_id: Some(sid.to_string()),
                    usage: Some(TokenUsage {
                        output_tokens: 3,
                        ..TokenUsage::default()
                    }),
                });
            }
            conductor_core::ndjson::str_at(&doc, &["error"])
                .map(|e| StreamEvent::Error(e.to_string()))
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn display_quotes_arguments() {
        let spec = CommandSpec::new("claude")
            .arg("-p")
            .arg("it's a test")
            .arg("--model=opus");
        assert_eq!(spec.to_string(), r"claude -p 'it'\''s a test' --model=opus");
    }

    #[test]
    fn error_message_prefers_exec_error() {
        let outcome = ExecOutcome {
            exit_code: 2,
            stderr: "warning\nfatal: bad flag\n".into(),
            ..ExecOutcome::default()
        };
        assert_eq!(outcome.error_message().unwrap(), "exit code 2: fatal: bad flag");
        assert!(timed_out(Some(Duration::from_secs(1)))
            .error_message()
            .unwrap()
            .contains("timed out"));
        assert!(ExecOutcome::default().error_message().is_none());
    }

    #[test]
    fn stream_state_accumulates_usage() {
        let mut state = StreamState::default();
        state.observe(StreamEvent::Started {
            session_id: "s1".into(),
        });
        state.observe(StreamEvent::Text("a".into()));
        state.observe(StreamEvent::Text("b".into()));
        state.observe(StreamEvent::Done {
            session_id: None,
            usage: Some(TokenUsage {
                input_tokens: 4,
                ..TokenUsage::default()
            }),
        });
        assert_eq!(state.session_id.as_deref(), Some("s1"));
        assert_eq!(state.text, "a\nb");
        assert_eq!(state.usage.unwrap().input_tokens, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_text_and_exit_code() {
        let outcome = ProcessExecutor::default()
            .execute(ExecRequest::new(sh("echo hello; echo oops >&2; exit 3")))
            .await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.stderr.trim(), "oops");
        assert!(outcome.error.is_none());
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_exit_one() {
        let outcome = ProcessExecutor::default()
            .execute(ExecRequest::new(CommandSpec::new(
                "/nonexistent/conductor-test-binary",
            )))
            .await;
        assert_eq!(outcome.exit_code, EXIT_FAILURE);
        assert!(matches!(outcome.error, Some(ExecError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_reports_124() {
        let started = std::time::Instant::now();
        let outcome = ProcessExecutor::default()
            .execute(
                ExecRequest::new(sh("echo started; sleep 30"))
                    .timeout(Some(Duration::from_millis(200))),
            )
            .await;
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(matches!(outcome.error, Some(ExecError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.content, "started");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn json_mode_extracts_fields() {
        let outcome = ProcessExecutor::default()
            .execute(
                ExecRequest::new(sh(r#"echo 'banner'; echo '{"sid":"abc","text":"42"}'"#))
                    .output(OutputMode::Json(Arc::new(LineParser))),
            )
            .await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.session_id.as_deref(), Some("abc"));
        assert_eq!(outcome.content, "42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn json_backend_error_on_clean_exit_fails() {
        let outcome = ProcessExecutor::default()
            .execute(
                ExecRequest::new(sh(r#"echo '{"error":"quota exceeded"}'"#))
                    .output(OutputMode::Json(Arc::new(LineParser))),
            )
            .await;
        assert_eq!(outcome.exit_code, EXIT_FAILURE);
        assert!(matches!(outcome.error, Some(ExecError::Backend(ref m)) if m == "quota exceeded"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_mode_collects_events() {
        let script = r#"echo '{"text":"one"}'; echo noise; echo '{"text":"two"}'; echo '{"done":"sess-9"}'"#;
        let outcome = ProcessExecutor::default()
            .execute(ExecRequest::new(sh(script)).output(OutputMode::Stream {
                parser: Arc::new(LineParser),
                passthrough: false,
            }))
            .await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.content, "one\ntwo");
        assert_eq!(outcome.session_id.as_deref(), Some("sess-9"));
        assert_eq!(outcome.usage.unwrap().output_tokens, 3);
        assert!(outcome.output.contains("noise"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_error_event_is_returned() {
        let outcome = ProcessExecutor::default()
            .execute(
                ExecRequest::new(sh(r#"echo '{"error":"rate limited"}'"#)).output(
                    OutputMode::Stream {
                        parser: Arc::new(LineParser),
                        passthrough: false,
                    },
                ),
            )
            .await;
        assert_eq!(outcome.exit_code, EXIT_FAILURE);
        assert!(matches!(outcome.error, Some(ExecError::Backend(ref m)) if m == "rate limited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn working_dir_and_env_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = sh("pwd; echo $CONDUCTOR_TEST_VALUE")
            .current_dir(dir.path())
            .env("CONDUCTOR_TEST_VALUE", "xyz");
        let outcome = ProcessExecutor::default().execute(ExecRequest::new(spec)).await;
        let canonical = dir.path().canonicalize().unwrap();
        assert!(outcome.content.contains(&*canonical.to_string_lossy()));
        assert!(outcome.content.ends_with("xyz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_maps_above_128() {
        let outcome = ProcessExecutor::default()
            .execute(ExecRequest::new(sh("kill -TERM $$")))
            .await;
        assert_eq!(outcome.exit_code, 128 + 15);
    }

    #[tokio::test]
    async fn passthrough_echo_keeps_parsing() {
        let input: &[u8] = b"{\"text\":\"shown\"}\n{\"done\":\"s-1\"}\n";
        let captured = read_stdout(
            input,
            OutputMode::Stream {
                parser: Arc::new(LineParser),
                passthrough: true,
            },
        )
        .await;
        let state = captured.stream.unwrap();
        assert_eq!(state.text, "shown");
        assert_eq!(state.session_id.as_deref(), Some("s-1"));
        assert_eq!(captured.text.lines().count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwarding_enabled_run_completes() {
        let outcome = ProcessExecutor::default()
            .execute(ExecRequest::new(sh("echo fine")).forward_signals(true))
            .await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.content, "fine");
    }
}
