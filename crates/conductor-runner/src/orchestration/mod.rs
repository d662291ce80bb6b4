//! Task orchestration over the process executor.
//!
//! - [`Orchestrator`]: per-task execution with breaker and session bookkeeping,
//!   plus single runs and session resume.
//! - Parallel batches ([`Orchestrator::run_parallel`]) under a [`WorkerPool`]
//!   with fail-fast cancellation.
//! - Sequential chains ([`Orchestrator::run_chain`]) with `{{previous}}`
//!   output substitution.
//! - Multi-backend comparison ([`Orchestrator::run_compare`]).

mod chain;
mod compare;
mod orchestrator;
mod parallel;
pub mod pool;
mod types;

pub use chain::{ChainOptions, PREVIOUS_PLACEHOLDER, substitute_previous};
pub use compare::CompareOptions;
pub use orchestrator::{Orchestrator, OrchestratorSettings, SingleRunMode};
pub use parallel::ParallelOptions;
pub use pool::{PoolError, PoolPermit, WorkerPool};
pub use types::{
    BackendSummary, CANCELED_REASON, ChainReport, CompareReport, INTERRUPTED_REASON,
    OrchestrationError, ParallelReport, SingleRunOutcome, SkippedBackend, TaskResult, TaskSpec,
    Timing, parse_task_file,
};
