//! The [`Orchestrator`]: per-task execution shared by every run mode.
//!
//! A task goes through backend lookup, availability check, command
//! construction, the circuit breaker, session creation, execution and
//! finally outcome recording. Any failure along the way is captured on the
//! [`TaskResult`]; nothing here aborts a whole run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use conductor_core::Config;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, BackendRegistry, OutputFormat, TaskOptions};
use crate::breaker::BreakerRegistry;
use crate::session::{NewSession, Session, SessionStatus, SessionStore, StoreError};
use crate::subprocess::{
    CommandSpec, EXIT_FAILURE, ExecOutcome, ExecRequest, Interrupt, OutputMode, ProcessExecutor,
    TerminalMode,
};

use super::pool::DEFAULT_MAX_PARALLEL;
use super::types::{OrchestrationError, SingleRunOutcome, TaskResult, TaskSpec};

/// Run-wide defaults, read once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub max_parallel: usize,
    pub fail_fast: bool,
    /// Per-subprocess timeout.
    pub command_timeout: Option<Duration>,
    /// SIGTERM to SIGKILL escalation delay.
    pub grace_period: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        let orchestration = &config.orchestration;
        Self {
            max_parallel: if orchestration.max_parallel == 0 {
                DEFAULT_MAX_PARALLEL
            } else {
                orchestration.max_parallel
            },
            fail_fast: orchestration.fail_fast,
            command_timeout: orchestration.command_timeout(),
            grace_period: orchestration.grace_period(),
        }
    }
}

/// How a single run is attached to the caller's terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleRunMode {
    pub terminal: TerminalMode,
    /// Echo streaming output lines as they arrive.
    pub passthrough: bool,
}

/// I/O policy for one task execution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attach {
    pub terminal: TerminalMode,
    pub passthrough: bool,
}

impl Attach {
    /// Captured pipes, used by the batch modes.
    pub(crate) const CAPTURED: Self = Self {
        terminal: TerminalMode::Pipe,
        passthrough: false,
    };
}

/// Where the session record for an execution comes from.
enum SessionPlan {
    /// Create a fresh record.
    Create(NewSession),
    /// Continue an existing record.
    Continue(String),
}

/// Outcome of one execution plus its bookkeeping ids.
struct Invocation {
    outcome: ExecOutcome,
    session_id: Option<String>,
    duration: Duration,
}

/// Drives backend tasks through the executor, breakers and session store.
#[derive(Clone)]
pub struct Orchestrator {
    backends: Arc<BackendRegistry>,
    executor: ProcessExecutor,
    settings: OrchestratorSettings,
    sessions: Option<SessionStore>,
    breakers: Option<Arc<BreakerRegistry>>,
    interrupt: Interrupt,
}

impl Orchestrator {
    pub fn new(backends: BackendRegistry, settings: OrchestratorSettings) -> Self {
        Self {
            backends: Arc::new(backends),
            executor: ProcessExecutor::new(settings.grace_period),
            settings,
            sessions: None,
            breakers: None,
            interrupt: Interrupt::new(),
        }
    }

    /// Built-in backends and settings from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            BackendRegistry::with_defaults(config),
            OrchestratorSettings::from(config),
        )
    }

    /// Record every run in `store`.
    #[must_use]
    pub fn with_sessions(mut self, store: SessionStore) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Consult per-backend circuit breakers before each run.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Share `interrupt` with the caller so a signal received while no child
    /// runs stops the remaining work too.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Raised once a termination signal was forwarded to a child.
    pub const fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub const fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_ref()
    }

    /// Run one prompt against `backend`.
    ///
    /// Pre-flight problems (unavailable backend, invalid options, open
    /// circuit) are returned as errors; execution failures are reported in
    /// the outcome's exit code and error.
    pub async fn run_single(
        &self,
        backend: Arc<dyn Backend>,
        prompt: &str,
        options: &TaskOptions,
        mode: SingleRunMode,
    ) -> Result<SingleRunOutcome, OrchestrationError> {
        let command = self.prepare(backend.as_ref(), prompt, options)?;
        self.admit(backend.name())?;

        let plan = SessionPlan::Create(NewSession {
            backend: backend.name().to_string(),
            work_dir: options.work_dir.clone(),
            model: options.model.clone(),
            prompt: prompt.to_string(),
            ..NewSession::default()
        });
        let attach = Attach {
            terminal: mode.terminal,
            passthrough: mode.passthrough,
        };
        let invocation = self
            .invoke(backend.as_ref(), command, options, attach, plan)
            .await;
        Ok(single_outcome(backend.name(), invocation))
    }

    /// Continue a stored session through the backend's native resume support.
    ///
    /// `options` supplies anything not recorded on the session; the session's
    /// working directory and model are used when `options` leaves them unset.
    pub async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &TaskOptions,
        mode: SingleRunMode,
    ) -> Result<SingleRunOutcome, OrchestrationError> {
        let store = self
            .sessions
            .clone()
            .ok_or(OrchestrationError::NoSessionStore)?;
        let id = session_id.to_string();
        let session: Session = blocking(store, move |s| s.get(&id)).await?;

        let backend_session = session
            .backend_session_id
            .clone()
            .ok_or_else(|| OrchestrationError::NotResumable {
                id: session.id.clone(),
            })?;
        let backend = self.backends.require(&session.backend)?;

        let mut options = options.clone();
        options.resume_session = Some(backend_session);
        if options.work_dir.is_none() {
            options.work_dir.clone_from(&session.work_dir);
        }
        if options.model.is_none() {
            options.model.clone_from(&session.model);
        }

        let command = self.prepare(backend.as_ref(), prompt, &options)?;
        self.admit(backend.name())?;
        info!(session_id = %session.id, backend = %session.backend, "Resuming session");

        let attach = Attach {
            terminal: mode.terminal,
            passthrough: mode.passthrough,
        };
        let invocation = self
            .invoke(
                backend.as_ref(),
                command,
                &options,
                attach,
                SessionPlan::Continue(session.id),
            )
            .await;
        Ok(single_outcome(backend.name(), invocation))
    }

    /// Run one task to a [`TaskResult`]. Never fails; problems land on the result.
    pub(crate) async fn execute_task(
        &self,
        index: usize,
        spec: &TaskSpec,
        attach: Attach,
    ) -> TaskResult {
        let backend = match self.backends.require(&spec.backend) {
            Ok(backend) => backend,
            Err(e) => return TaskResult::not_run(index, spec, EXIT_FAILURE, e.to_string()),
        };
        let command = match self.prepare(backend.as_ref(), &spec.prompt, &spec.options) {
            Ok(command) => command,
            Err(e) => {
                warn!(task = %spec.display_id(index), error = %e, "Task not started");
                return TaskResult::not_run(index, spec, EXIT_FAILURE, e.to_string());
            }
        };

        if spec.dry_run {
            let mut result = TaskResult::not_run(index, spec, 0, "");
            result.error = None;
            result.output = command.to_string();
            info!(task = %result.id, command = %result.output, "Dry run");
            return result;
        }

        if let Err(e) = self.admit(backend.name()) {
            return TaskResult::not_run(index, spec, EXIT_FAILURE, e.to_string());
        }

        let plan = SessionPlan::Create(NewSession {
            backend: spec.backend.clone(),
            work_dir: spec.options.work_dir.clone(),
            model: spec.options.model.clone(),
            prompt: spec.prompt.clone(),
            tags: spec.tags.clone(),
            parent_id: None,
            metadata: spec.metadata.clone(),
        });

        let started_at = Utc::now();
        info!(task = %spec.display_id(index), backend = %spec.backend, "Task started");
        let invocation = self
            .invoke(backend.as_ref(), command, &spec.options, attach, plan)
            .await;
        let outcome = invocation.outcome;

        let result = TaskResult {
            index,
            id: spec.display_id(index),
            name: spec.name.clone(),
            backend: spec.backend.clone(),
            exit_code: outcome.exit_code,
            error: outcome.error_message(),
            output: outcome.content,
            started_at,
            ended_at: Utc::now(),
            duration: invocation.duration,
            session_id: invocation.session_id,
            backend_session_id: outcome.session_id,
            usage: outcome.usage,
        };
        info!(
            task = %result.id,
            exit_code = result.exit_code,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Task finished"
        );
        result
    }

    /// Check availability and build the command line.
    fn prepare(
        &self,
        backend: &dyn Backend,
        prompt: &str,
        options: &TaskOptions,
    ) -> Result<CommandSpec, BackendError> {
        if !backend.is_available() {
            return Err(BackendError::Unavailable {
                name: backend.name().to_string(),
                binary: backend.binary().to_path_buf(),
            });
        }
        backend.build_command(prompt, options)
    }

    /// Ask the backend's circuit breaker, if any, whether to proceed.
    fn admit(&self, backend: &str) -> Result<(), OrchestrationError> {
        let Some(breakers) = &self.breakers else {
            return Ok(());
        };
        if breakers.get(backend).allow() {
            Ok(())
        } else {
            warn!(backend, "Circuit open, task rejected");
            Err(OrchestrationError::CircuitOpen {
                backend: backend.to_string(),
            })
        }
    }

    async fn invoke(
        &self,
        backend: &dyn Backend,
        command: CommandSpec,
        options: &TaskOptions,
        attach: Attach,
        plan: SessionPlan,
    ) -> Invocation {
        let session_id = self.open_session(plan).await;

        let parser = backend.parser();
        let output = match options.output_format {
            OutputFormat::Text => OutputMode::Text,
            OutputFormat::Json => OutputMode::Json(parser),
            OutputFormat::StreamJson => OutputMode::Stream {
                parser,
                passthrough: attach.passthrough,
            },
        };
        let request = ExecRequest::new(command)
            .output(output)
            .terminal(attach.terminal)
            .timeout(self.settings.command_timeout)
            .forward_signals(true)
            .interrupt(self.interrupt.clone());

        let clock = Instant::now();
        let outcome = self.executor.execute(request).await;
        let duration = clock.elapsed();

        if let Some(breakers) = &self.breakers {
            let breaker = breakers.get(backend.name());
            if outcome.success() {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        if let Some(id) = &session_id {
            self.close_session(id, &outcome).await;
        }

        Invocation {
            outcome,
            session_id,
            duration,
        }
    }

    /// Create or look up the session record. Failures are logged, never fatal.
    async fn open_session(&self, plan: SessionPlan) -> Option<String> {
        let store = self.sessions.clone()?;
        match plan {
            SessionPlan::Create(new) => match blocking(store, move |s| s.create(new)).await {
                Ok(session) => Some(session.id),
                Err(e) => {
                    warn!(error = %e, "Failed to create session record");
                    None
                }
            },
            SessionPlan::Continue(id) => {
                let target = id.clone();
                let reopened = blocking(store, move |s| {
                    s.update(&target, |session| {
                        session.status = SessionStatus::Active;
                        session.error = None;
                    })
                })
                .await;
                if let Err(e) = reopened {
                    warn!(session_id = %id, error = %e, "Failed to reopen session record");
                }
                Some(id)
            }
        }
    }

    async fn close_session(&self, id: &str, outcome: &ExecOutcome) {
        let Some(store) = self.sessions.clone() else {
            return;
        };
        let id = id.to_string();
        let success = outcome.success();
        let error = outcome.error_message();
        let backend_session = outcome.session_id.clone();
        let usage = outcome.usage;

        let target = id.clone();
        let result = blocking(store, move |s| {
            s.update(&target, |session| {
                session.status = if success {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Error
                };
                session.error = error;
                if backend_session.is_some() {
                    session.backend_session_id = backend_session;
                }
                session.record_turn(usage.as_ref());
            })
        })
        .await;
        match result {
            Ok(session) => debug!(session_id = %id, status = %session.status, "Session recorded"),
            Err(e) => warn!(session_id = %id, error = %e, "Failed to update session record"),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .field("sessions", &self.sessions.as_ref().map(SessionStore::dir))
            .field("breakers", &self.breakers.is_some())
            .field("interrupted", &self.interrupt.is_raised())
            .finish()
    }
}

fn single_outcome(backend: &str, invocation: Invocation) -> SingleRunOutcome {
    let outcome = invocation.outcome;
    SingleRunOutcome {
        backend: backend.to_string(),
        exit_code: outcome.exit_code,
        error: outcome.error_message(),
        content: outcome.content,
        session_id: invocation.session_id,
        backend_session_id: outcome.session_id,
        usage: outcome.usage,
        duration: invocation.duration,
    }
}

/// Run a blocking session store operation off the async runtime.
async fn blocking<T, F>(store: SessionStore, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&SessionStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}
