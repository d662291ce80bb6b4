//! Bounded-concurrency batches with optional fail-fast.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::subprocess::EXIT_FAILURE;

use super::orchestrator::{Attach, Orchestrator};
use super::pool::WorkerPool;
use super::types::{ParallelReport, TaskResult, TaskSpec, Timing};

/// Per-call overrides for a parallel batch. `None` uses the configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParallelOptions {
    pub max_parallel: Option<usize>,
    pub fail_fast: Option<bool>,
}

type Slots = Arc<Mutex<Vec<Option<TaskResult>>>>;

fn fill(slots: &Slots, index: usize, result: TaskResult) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = slots.get_mut(index) {
        *slot = Some(result);
    }
}

impl Orchestrator {
    /// Run `tasks` under a bounded pool.
    ///
    /// Results are positional: `report.results[i]` belongs to `tasks[i]`
    /// whatever the completion order. With fail-fast on, the first failure
    /// stops tasks that have not started yet; running tasks finish normally.
    /// An interrupt stops tasks that have not started the same way.
    pub async fn run_parallel(&self, tasks: Vec<TaskSpec>, options: ParallelOptions) -> ParallelReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let pool = WorkerPool::new(options.max_parallel.unwrap_or(self.settings().max_parallel));
        let fail_fast = options.fail_fast.unwrap_or(self.settings().fail_fast);

        info!(
            tasks = tasks.len(),
            max_parallel = pool.max_parallel(),
            fail_fast,
            "Starting parallel batch"
        );
        let results = self.run_pooled(tasks, &pool, fail_fast).await;
        let report = ParallelReport::new(
            results,
            Timing::since(started_at, clock),
            self.is_interrupted(),
        );
        info!(
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            canceled = report.canceled,
            "Parallel batch finished"
        );
        report
    }

    /// Dispatch `tasks` in submission order through `pool`, returning one
    /// result per task.
    pub(crate) async fn run_pooled(
        &self,
        tasks: Vec<TaskSpec>,
        pool: &WorkerPool,
        fail_fast: bool,
    ) -> Vec<TaskResult> {
        // Fail-fast cancels this batch only; an interrupt cancels it from above.
        let cancel = self.interrupt().token().child_token();
        let slots: Slots = Arc::new(Mutex::new(vec![None; tasks.len()]));
        let tasks: Vec<Arc<TaskSpec>> = tasks.into_iter().map(Arc::new).collect();
        let mut running = JoinSet::new();

        for (index, spec) in tasks.iter().enumerate() {
            let Some(permit) = pool.acquire_or_cancel(&cancel).await else {
                let result = if self.is_interrupted() {
                    TaskResult::interrupted(index, spec)
                } else {
                    TaskResult::canceled(index, spec)
                };
                info!(task = %result.id, reason = ?result.error, "Task canceled before start");
                fill(&slots, index, result);
                continue;
            };
            debug!(
                task = %spec.display_id(index),
                free_slots = pool.available_permits(),
                "Task dispatched"
            );

            let this = self.clone();
            let spec = Arc::clone(spec);
            let cancel = cancel.clone();
            let slots = Arc::clone(&slots);
            running.spawn(async move {
                let _permit = permit;
                let result = this.execute_task(index, &spec, Attach::CAPTURED).await;
                if fail_fast && !result.is_success() && !cancel.is_cancelled() {
                    warn!(task = %result.id, "Task failed, canceling pending tasks");
                    cancel.cancel();
                }
                fill(&slots, index, result);
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Task aborted");
            }
        }

        let filled = std::mem::take(&mut *slots.lock().unwrap_or_else(PoisonError::into_inner));
        filled
            .into_iter()
            .zip(&tasks)
            .enumerate()
            .map(|(index, (slot, spec))| {
                slot.unwrap_or_else(|| {
                    TaskResult::not_run(index, spec, EXIT_FAILURE, "task aborted before reporting")
                })
            })
            .collect()
    }
}
