//! Task specifications, per-task results and aggregate reports.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::TokenUsage;
use serde::{Deserialize, Serialize, Serializer};

use crate::backend::{BackendError, TaskOptions};
use crate::session::StoreError;
use crate::subprocess::EXIT_CANCELED;

/// Error recorded on tasks skipped because fail-fast fired.
pub const CANCELED_REASON: &str = "canceled: an earlier task failed (fail-fast)";

/// Error recorded on tasks skipped because conductor was interrupted.
pub const INTERRUPTED_REASON: &str = "canceled: interrupted";

/// One requested backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub backend: String,
    pub prompt: String,
    #[serde(flatten)]
    pub options: TaskOptions,
    /// Build the command but do not run it.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TaskSpec {
    pub fn new(backend: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            backend: backend.into(),
            prompt: prompt.into(),
            options: TaskOptions::default(),
            dry_run: false,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Caller-supplied id, or a positional one.
    pub fn display_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("task-{}", index + 1))
    }
}

/// Parse a task file: a JSON array of [`TaskSpec`] or `{"tasks": [...]}`.
pub fn parse_task_file(content: &str) -> Result<Vec<TaskSpec>, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TaskFile {
        List(Vec<TaskSpec>),
        Wrapped {
            #[serde(alias = "steps")]
            tasks: Vec<TaskSpec>,
        },
    }

    Ok(match serde_json::from_str(content)? {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    })
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Outcome of one task, written once when the task finishes or is skipped.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub index: usize,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub backend: String,
    /// 0 success, -1 canceled, 124 timeout, anything else a failure.
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
    /// Session store id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl TaskResult {
    /// A result for a task that never ran.
    pub fn not_run(index: usize, spec: &TaskSpec, exit_code: i32, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            index,
            id: spec.display_id(index),
            name: spec.name.clone(),
            backend: spec.backend.clone(),
            exit_code,
            error: Some(error.into()),
            output: String::new(),
            started_at: now,
            ended_at: now,
            duration: Duration::ZERO,
            session_id: None,
            backend_session_id: None,
            usage: None,
        }
    }

    pub fn canceled(index: usize, spec: &TaskSpec) -> Self {
        Self::not_run(index, spec, EXIT_CANCELED, CANCELED_REASON)
    }

    pub fn interrupted(index: usize, spec: &TaskSpec) -> Self {
        Self::not_run(index, spec, EXIT_CANCELED, INTERRUPTED_REASON)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    pub const fn is_canceled(&self) -> bool {
        self.exit_code == EXIT_CANCELED
    }

    /// Display label: the name when given, the id otherwise.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Wall-clock span of a whole run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
}

impl Timing {
    pub(crate) fn since(started_at: DateTime<Utc>, clock: std::time::Instant) -> Self {
        Self {
            started_at,
            ended_at: Utc::now(),
            duration: clock.elapsed(),
        }
    }
}

/// Result of a parallel batch.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks skipped by fail-fast or an interrupt.
    /// `completed + failed + canceled == total`.
    pub canceled: usize,
    /// A termination signal stopped the batch.
    pub interrupted: bool,
    pub results: Vec<TaskResult>,
    #[serde(flatten)]
    pub timing: Timing,
}

impl ParallelReport {
    pub(crate) fn new(results: Vec<TaskResult>, timing: Timing, interrupted: bool) -> Self {
        let canceled = results.iter().filter(|r| r.is_canceled()).count();
        let completed = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            completed,
            failed: results.len() - completed - canceled,
            canceled,
            interrupted,
            results,
            timing,
        }
    }

    /// `Err` naming the number of failed tasks, if any failed.
    pub fn ensure_success(&self) -> Result<(), OrchestrationError> {
        if self.interrupted {
            Err(OrchestrationError::Interrupted)
        } else if self.failed == 0 && self.canceled == 0 {
            Ok(())
        } else {
            Err(OrchestrationError::TasksFailed { count: self.failed })
        }
    }
}

/// Result of a sequential chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    /// Number of steps submitted.
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Steps that ran, in order. Steps after a stopping failure are absent.
    pub results: Vec<TaskResult>,
    /// 1-based step at which the chain stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<usize>,
    /// A termination signal stopped the chain.
    pub interrupted: bool,
    /// Output of the last step that ran.
    pub final_output: String,
    #[serde(flatten)]
    pub timing: Timing,
}

impl ChainReport {
    /// 1-based number of the first failing step.
    pub fn first_failure(&self) -> Option<usize> {
        self.results
            .iter()
            .position(|r| !r.is_success())
            .map(|i| i + 1)
    }

    pub fn ensure_success(&self) -> Result<(), OrchestrationError> {
        if self.interrupted {
            return Err(OrchestrationError::Interrupted);
        }
        match self.first_failure() {
            Some(step) => Err(OrchestrationError::ChainFailed { step }),
            None => Ok(()),
        }
    }
}

/// A backend left out of a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedBackend {
    pub backend: String,
    pub reason: String,
}

/// Pass/fail line for one backend in a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub backend: String,
    pub success: bool,
    pub exit_code: i32,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TaskResult> for BackendSummary {
    fn from(result: &TaskResult) -> Self {
        Self {
            backend: result.backend.clone(),
            success: result.is_success(),
            exit_code: result.exit_code,
            duration: result.duration,
            error: result.error.clone(),
        }
    }
}

/// Result of running one prompt across several backends.
#[derive(Debug, Clone, Serialize)]
pub struct CompareReport {
    pub prompt: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<TaskResult>,
    pub summary: Vec<BackendSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedBackend>,
    /// A termination signal stopped the comparison; backends that never ran
    /// count as failed.
    pub interrupted: bool,
    #[serde(flatten)]
    pub timing: Timing,
}

impl CompareReport {
    pub fn ensure_success(&self) -> Result<(), OrchestrationError> {
        if self.interrupted {
            Err(OrchestrationError::Interrupted)
        } else if self.failed == 0 {
            Ok(())
        } else {
            Err(OrchestrationError::BackendsFailed { count: self.failed })
        }
    }
}

/// Result of a single run or resume.
#[derive(Debug, Clone, Serialize)]
pub struct SingleRunOutcome {
    pub backend: String,
    pub exit_code: i32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session store id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(rename = "duration_secs", serialize_with = "as_secs")]
    pub duration: Duration,
}

impl SingleRunOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Errors surfaced by orchestration entry points.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("{count} task(s) failed")]
    TasksFailed { count: usize },

    #[error("chain failed at step {step}")]
    ChainFailed { step: usize },

    #[error("some backends failed")]
    BackendsFailed { count: usize },

    #[error("no backends available")]
    NoBackendsAvailable,

    #[error("interrupted")]
    Interrupted,

    #[error("circuit breaker for '{backend}' is open")]
    CircuitOpen { backend: String },

    #[error("session {id} has no backend session to resume")]
    NotResumable { id: String },

    #[error("no session store configured")]
    NoSessionStore,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
