//! One prompt across several backends.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::backend::TaskOptions;

use super::orchestrator::{Attach, Orchestrator};
use super::pool::WorkerPool;
use super::types::{
    BackendSummary, CompareReport, OrchestrationError, SkippedBackend, TaskResult, TaskSpec,
    Timing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Run all backends at once instead of one after another.
    pub parallel: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl Orchestrator {
    /// Run `prompt` once per backend in `backends`.
    ///
    /// Unknown or unavailable backends are skipped with a warning and listed
    /// in the report; only an empty remainder is an error.
    pub async fn run_compare(
        &self,
        prompt: &str,
        backends: &[String],
        template: &TaskOptions,
        options: CompareOptions,
    ) -> Result<CompareReport, OrchestrationError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut tasks = Vec::with_capacity(backends.len());
        let mut skipped = Vec::new();
        for name in backends {
            let reason = match self.backends().get(name) {
                None => Some("unknown backend".to_string()),
                Some(backend) if !backend.is_available() => Some(format!(
                    "binary {} not found",
                    backend.binary().display()
                )),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                warn!(backend = %name, %reason, "Skipping backend");
                skipped.push(SkippedBackend {
                    backend: name.clone(),
                    reason,
                });
                continue;
            }
            let mut task = TaskSpec::new(name.clone(), prompt).with_options(template.clone());
            task.id = Some(name.clone());
            tasks.push(task);
        }
        if tasks.is_empty() {
            return Err(OrchestrationError::NoBackendsAvailable);
        }

        info!(backends = tasks.len(), parallel = options.parallel, "Starting comparison");
        let results = if options.parallel {
            let pool = WorkerPool::new(tasks.len());
            self.run_pooled(tasks, &pool, false).await
        } else {
            let mut results = Vec::with_capacity(tasks.len());
            for (index, task) in tasks.iter().enumerate() {
                let result = if self.is_interrupted() {
                    TaskResult::interrupted(index, task)
                } else {
                    self.execute_task(index, task, Attach::CAPTURED).await
                };
                results.push(result);
            }
            results
        };

        let completed = results.iter().filter(|r| r.is_success()).count();
        let report = CompareReport {
            prompt: prompt.to_string(),
            total: results.len(),
            completed,
            failed: results.len() - completed,
            summary: results.iter().map(BackendSummary::from).collect(),
            results,
            skipped,
            interrupted: self.is_interrupted(),
            timing: Timing::since(started_at, clock),
        };
        info!(
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            "Comparison finished"
        );
        Ok(report)
    }
}
