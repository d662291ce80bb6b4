//! Sequential chains with previous-output substitution.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use super::orchestrator::{Attach, Orchestrator};
use super::types::{ChainReport, TaskSpec, Timing};

/// Replaced in each step's prompt with the previous step's output.
pub const PREVIOUS_PLACEHOLDER: &str = "{{previous}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Stop at the first failing step.
    pub stop_on_failure: bool,
    /// Steps without a working directory inherit the previous step's.
    pub pass_workdir: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            pass_workdir: false,
        }
    }
}

/// Substitute `previous` for every placeholder, verbatim.
pub fn substitute_previous(template: &str, previous: &str) -> String {
    template.replace(PREVIOUS_PLACEHOLDER, previous)
}

impl Orchestrator {
    /// Run `steps` one after another.
    ///
    /// Context flows only through the substituted prompt text; no backend
    /// session is carried from one step to the next. An interrupt stops the
    /// chain after the step that was running, whatever `stop_on_failure` says.
    pub async fn run_chain(&self, steps: Vec<TaskSpec>, options: ChainOptions) -> ChainReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = steps.len();
        info!(steps = total, stop_on_failure = options.stop_on_failure, "Starting chain");

        let mut results = Vec::with_capacity(total);
        let mut previous_output = String::new();
        let mut previous_dir = None;
        let mut stopped_at = None;

        for (index, mut step) in steps.into_iter().enumerate() {
            step.prompt = substitute_previous(&step.prompt, previous_output.trim_end());
            if options.pass_workdir && step.options.work_dir.is_none() {
                step.options.work_dir.clone_from(&previous_dir);
            }

            let result = self.execute_task(index, &step, Attach::CAPTURED).await;
            previous_output.clone_from(&result.output);
            if step.options.work_dir.is_some() {
                previous_dir.clone_from(&step.options.work_dir);
            }

            let failed = !result.is_success();
            results.push(result);
            if self.is_interrupted() {
                warn!(step = index + 1, "Chain interrupted, stopping");
                stopped_at = Some(index + 1);
                break;
            }
            if failed && options.stop_on_failure {
                warn!(step = index + 1, "Chain step failed, stopping");
                stopped_at = Some(index + 1);
                break;
            }
        }

        let completed = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - completed;
        let report = ChainReport {
            total,
            completed,
            failed,
            final_output: previous_output,
            results,
            stopped_at,
            interrupted: self.is_interrupted(),
            timing: Timing::since(started_at, clock),
        };
        info!(
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            "Chain finished"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_occurrence_verbatim() {
        let prompt = substitute_previous("a {{previous}} b {{previous}}", "$x & \"y\"\\n");
        assert_eq!(prompt, "a $x & \"y\"\\n b $x & \"y\"\\n");
    }

    #[test]
    fn template_without_placeholder_is_unchanged() {
        assert_eq!(substitute_previous("plain", "ignored"), "plain");
    }

    #[test]
    fn defaults_stop_on_failure() {
        let options = ChainOptions::default();
        assert!(options.stop_on_failure);
        assert!(!options.pass_workdir);
    }
}
