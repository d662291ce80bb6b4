//! Human-readable rendering of orchestration reports.

use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use conductor_runner::orchestration::{
    ChainReport, CompareReport, ParallelReport, SingleRunOutcome, TaskResult,
};

pub fn truncate(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max.saturating_sub(1)).collect::<String>())
    }
}

/// `850ms`, `12.3s` or `4m05s`.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis < 1_000 {
        format!("{millis}ms")
    } else if d.as_secs() < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60)
    }
}

fn status_tag(result: &TaskResult) -> &'static str {
    if result.is_success() {
        "ok"
    } else if result.is_canceled() {
        "canceled"
    } else {
        "FAIL"
    }
}

/// One line per task, plus an indented error line for real failures.
/// Canceled tasks carry only the tag; the summary explains why.
pub fn write_task_line(w: &mut impl Write, result: &TaskResult) -> io::Result<()> {
    write!(
        w,
        "[{:<8}] {:<24} {:<8} {:>8}",
        status_tag(result),
        truncate(result.label(), 24),
        result.backend,
        format_duration(result.duration),
    )?;
    if !result.is_success() && !result.is_canceled() {
        write!(w, "  exit {}", result.exit_code)?;
    }
    writeln!(w)?;
    if let Some(error) = &result.error
        && !result.is_canceled()
    {
        writeln!(w, "           Error: {}", truncate(error, 200))?;
    }
    Ok(())
}

pub fn write_parallel_report(w: &mut impl Write, report: &ParallelReport) -> io::Result<()> {
    for result in &report.results {
        write_task_line(w, result)?;
    }
    writeln!(
        w,
        "\n{} total, {} completed, {} failed, {} canceled in {}",
        report.total,
        report.completed,
        report.failed,
        report.canceled,
        format_duration(report.timing.duration),
    )?;
    write_interrupted(w, report.interrupted)
}

fn write_interrupted(w: &mut impl Write, interrupted: bool) -> io::Result<()> {
    if interrupted {
        writeln!(w, "Interrupted, remaining work was not started")?;
    }
    Ok(())
}

pub fn write_chain_report(w: &mut impl Write, report: &ChainReport) -> io::Result<()> {
    for result in &report.results {
        write_task_line(w, result)?;
    }
    if let Some(step) = report.stopped_at {
        writeln!(w, "Stopped at step {step} of {}", report.total)?;
    }
    writeln!(
        w,
        "\n{} step(s), {} completed, {} failed in {}",
        report.total,
        report.completed,
        report.failed,
        format_duration(report.timing.duration),
    )?;
    write_interrupted(w, report.interrupted)?;
    if !report.final_output.is_empty() {
        writeln!(w, "\n{}", report.final_output)?;
    }
    Ok(())
}

pub fn write_compare_report(w: &mut impl Write, report: &CompareReport) -> io::Result<()> {
    for skipped in &report.skipped {
        writeln!(w, "[skipped ] {:<24} {}", skipped.backend, skipped.reason)?;
    }
    for result in &report.results {
        writeln!(w, "\n=== {} ===", result.backend)?;
        if result.output.is_empty() {
            writeln!(w, "(no output)")?;
        } else {
            writeln!(w, "{}", result.output)?;
        }
    }
    writeln!(w)?;
    for summary in &report.summary {
        writeln!(
            w,
            "{:<10} {:<5} {:>8}{}",
            summary.backend,
            if summary.success { "pass" } else { "fail" },
            format_duration(summary.duration),
            summary
                .error
                .as_deref()
                .map(|e| format!("  {}", truncate(e, 120)))
                .unwrap_or_default(),
        )?;
    }
    writeln!(
        w,
        "\n{} backend(s), {} passed, {} failed in {}",
        report.total,
        report.completed,
        report.failed,
        format_duration(report.timing.duration),
    )?;
    write_interrupted(w, report.interrupted)
}

/// Trailing status line for a single run; the agent output is printed separately.
pub fn write_single_footer(w: &mut impl Write, outcome: &SingleRunOutcome) -> io::Result<()> {
    let mut line = format!(
        "{} finished in {} (exit {})",
        outcome.backend,
        format_duration(outcome.duration),
        outcome.exit_code
    );
    if let Some(id) = &outcome.session_id {
        line.push_str(&format!(", session {id}"));
    }
    if let Some(usage) = &outcome.usage
        && !usage.is_empty()
    {
        line.push_str(&format!(
            ", {} tokens ({} in / {} out)",
            usage.total(),
            usage.input_tokens,
            usage.output_tokens
        ));
    }
    writeln!(w, "{line}")
}

pub fn write_json(w: &mut impl Write, value: &impl Serialize) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *w, value)?;
    writeln!(w)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_runner::orchestration::TaskSpec;

    fn render(result: &TaskResult) -> String {
        let mut buf = Vec::new();
        write_task_line(&mut buf, result).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn truncate_is_char_aware() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ääääää", 4), "äää…");
    }

    #[test]
    fn durations_scale_units() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m05s");
    }

    #[test]
    fn failed_task_prints_error_line() {
        let spec = TaskSpec::new("codex", "p");
        let result = TaskResult::not_run(0, &spec, 2, "exit code 2: boom");
        let text = render(&result);
        assert!(text.starts_with("[FAIL    ] task-1"));
        assert!(text.contains("exit 2"));
        assert!(text.contains("Error: exit code 2: boom"));
    }

    #[test]
    fn canceled_task_has_no_error_line() {
        let spec = TaskSpec::new("claude", "p").named("review");
        let text = render(&TaskResult::canceled(1, &spec));
        assert!(text.starts_with("[canceled] review"));
        assert!(!text.contains("Error:"));
        assert_eq!(text.lines().count(), 1);

        let text = render(&TaskResult::interrupted(2, &spec));
        assert!(text.starts_with("[canceled] review"));
        assert_eq!(text.lines().count(), 1);
    }
}
