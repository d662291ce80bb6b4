//! CLI session management subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::time::Duration;

use clap::Subcommand;

use conductor_runner::session::{Session, SessionFilter, SessionStatus, SessionStore, StoreError};

use crate::report_fmt::{truncate, write_json};

/// Session subcommand actions.
#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// List sessions, most recently used first
    List {
        /// Filter by backend
        #[arg(short, long)]
        backend: Option<String>,
        /// Filter by status (active, completed, error, paused)
        #[arg(short, long)]
        status: Option<SessionStatus>,
        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one session in full
    Show {
        /// Session ID
        id: String,
    },
    /// Delete a session
    Delete {
        /// Session ID
        id: String,
    },
    /// Delete sessions unused for longer than the retention window
    Clean {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u64>,
    },
}

fn write_session_detail(w: &mut impl Write, s: &Session) -> io::Result<()> {
    writeln!(w, "  ID:       {}", s.id)?;
    writeln!(w, "  Backend:  {}", s.backend)?;
    writeln!(w, "  Status:   {}", s.status)?;
    writeln!(w, "  Created:  {}", s.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(w, "  Used:     {}", s.last_used.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(w, "  Turns:    {}", s.turn_count)?;
    if let Some(model) = &s.model {
        writeln!(w, "  Model:    {model}")?;
    }
    if let Some(dir) = &s.work_dir {
        writeln!(w, "  Dir:      {}", dir.display())?;
    }
    if let Some(native) = &s.backend_session_id {
        writeln!(w, "  Native:   {native}")?;
    }
    if !s.usage.is_empty() {
        writeln!(
            w,
            "  Tokens:   {} in / {} out / {} cached / {} reasoning",
            s.usage.input_tokens,
            s.usage.output_tokens,
            s.usage.cached_tokens,
            s.usage.reasoning_tokens
        )?;
    }
    if !s.tags.is_empty() {
        writeln!(w, "  Tags:     {}", s.tags.join(", "))?;
    }
    if let Some(parent) = &s.parent_id {
        writeln!(w, "  Parent:   {parent}")?;
    }
    if let Some(error) = &s.error {
        writeln!(w, "  Error:    {error}")?;
    }
    for (key, value) in &s.metadata {
        writeln!(w, "  {key}: {value}")?;
    }
    writeln!(w, "  Prompt:   {}", s.prompt)?;
    Ok(())
}

/// Execute a session subcommand.
pub fn run(
    store: &SessionStore,
    default_retention: Duration,
    action: SessionAction,
    json: bool,
) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        SessionAction::List {
            backend,
            status,
            tag,
            limit,
        } => {
            let filter = SessionFilter {
                backend,
                status,
                tag,
                limit: Some(limit),
            };
            let sessions = store.list(&filter)?;
            if json {
                write_json(&mut out, &sessions)?;
            } else if sessions.is_empty() {
                writeln!(out, "No sessions found.")?;
            } else {
                writeln!(
                    out,
                    "{:<36}  {:<8}  {:<10}  {:>5}  {:<16}  PROMPT",
                    "ID", "BACKEND", "STATUS", "TURNS", "LAST USED"
                )?;
                for s in &sessions {
                    writeln!(
                        out,
                        "{:<36}  {:<8}  {:<10}  {:>5}  {:<16}  {}",
                        s.id,
                        truncate(&s.backend, 8),
                        s.status,
                        s.turn_count,
                        s.last_used.format("%Y-%m-%d %H:%M"),
                        truncate(s.prompt.lines().next().unwrap_or_default(), 40),
                    )?;
                }
                writeln!(out, "\n{} session(s)", sessions.len())?;
            }
        }
        SessionAction::Show { id } => {
            let session = store.get(&id)?;
            if json {
                write_json(&mut out, &session)?;
            } else {
                write_session_detail(&mut out, &session)?;
            }
        }
        SessionAction::Delete { id } => match store.delete(&id) {
            Ok(()) => writeln!(out, "Session {id} deleted.")?,
            Err(StoreError::NotFound { .. }) => writeln!(out, "Session {id} not found.")?,
            Err(e) => return Err(e.into()),
        },
        SessionAction::Clean { days } => {
            let retention = days.map_or(default_retention, |d| Duration::from_secs(d * 24 * 60 * 60));
            let removed = store.clean(retention)?;
            writeln!(out, "Removed {removed} session(s).")?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use conductor_runner::session::NewSession;

    /// Test wrapper to parse CLI arguments.
    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        action: SessionAction,
    }

    #[test]
    fn parse_list_defaults() {
        let cli = TestCli::parse_from(["test", "list"]);
        match cli.action {
            SessionAction::List {
                backend,
                status,
                tag,
                limit,
            } => {
                assert!(backend.is_none());
                assert!(status.is_none());
                assert!(tag.is_none());
                assert_eq!(limit, 50);
            }
            other => panic!("Expected List, got {other:?}"),
        }
    }

    #[test]
    fn parse_list_with_filters() {
        let cli = TestCli::parse_from([
            "test", "list", "--backend", "codex", "--status", "error", "--tag", "nightly", "-l", "5",
        ]);
        match cli.action {
            SessionAction::List {
                backend,
                status,
                tag,
                limit,
            } => {
                assert_eq!(backend.as_deref(), Some("codex"));
                assert_eq!(status, Some(SessionStatus::Error));
                assert_eq!(tag.as_deref(), Some("nightly"));
                assert_eq!(limit, 5);
            }
            other => panic!("Expected List, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_status() {
        assert!(TestCli::try_parse_from(["test", "list", "--status", "zombie"]).is_err());
    }

    #[test]
    fn parse_clean_days() {
        let cli = TestCli::parse_from(["test", "clean", "--days", "7"]);
        match cli.action {
            SessionAction::Clean { days } => assert_eq!(days, Some(7)),
            other => panic!("Expected Clean, got {other:?}"),
        }
    }

    #[test]
    fn delete_and_show_against_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store
            .create(NewSession {
                backend: "gemini".into(),
                prompt: "summarize".into(),
                ..NewSession::default()
            })
            .unwrap();

        let retention = Duration::from_secs(3600);
        run(&store, retention, SessionAction::Show { id: session.id.clone() }, false).unwrap();
        run(&store, retention, SessionAction::Delete { id: session.id.clone() }, false).unwrap();
        assert!(matches!(
            store.get(&session.id),
            Err(StoreError::NotFound { .. })
        ));
        // Deleting again reports "not found" instead of failing.
        run(&store, retention, SessionAction::Delete { id: session.id }, false).unwrap();
    }

    #[test]
    fn detail_lists_core_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store
            .create(NewSession {
                backend: "claude".into(),
                prompt: "write tests".into(),
                tags: vec!["ci".into()],
                ..NewSession::default()
            })
            .unwrap();

        let mut buf = Vec::new();
        write_session_detail(&mut buf, &session).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Backend:  claude"));
        assert!(text.contains("Status:   active"));
        assert!(text.contains("Tags:     ci"));
        assert!(text.contains("Prompt:   write tests"));
    }
}
