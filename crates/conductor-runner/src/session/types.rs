//! Persisted session records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use conductor_core::TokenUsage;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Error,
    Paused,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Durable record of one backend run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub backend: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Session identifier assigned by the backend itself, used for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    /// Record a finished turn.
    pub fn record_turn(&mut self, usage: Option<&TokenUsage>) {
        self.turn_count += 1;
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
        self.last_used = Utc::now();
    }
}

/// Fields supplied when a session is created; the store fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub backend: String,
    pub work_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub prompt: String,
    pub tags: Vec<String>,
    pub parent_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Criteria for [`crate::session::SessionStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub backend: Option<String>,
    pub status: Option<SessionStatus>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.backend.as_ref().is_none_or(|b| *b == session.backend)
            && self.status.is_none_or(|s| s == session.status)
            && self.tag.as_ref().is_none_or(|t| session.tags.contains(t))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: "abc".into(),
            backend: "claude".into(),
            created_at: now,
            last_used: now,
            work_dir: None,
            backend_session_id: None,
            model: None,
            prompt: "hi".into(),
            status: SessionStatus::Active,
            turn_count: 0,
            usage: TokenUsage::default(),
            tags: vec!["review".into()],
            parent_id: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn record_turn_accumulates_usage() {
        let mut s = session();
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..TokenUsage::default()
        };
        s.record_turn(Some(&usage));
        s.record_turn(Some(&usage));
        s.record_turn(None);
        assert_eq!(s.turn_count, 3);
        assert_eq!(s.usage.input_tokens, 20);
        assert_eq!(s.usage.total(), 30);
    }

    #[test]
    fn filter_matches_all_criteria() {
        let s = session();
        assert!(SessionFilter::default().matches(&s));
        let by_tag = SessionFilter {
            tag: Some("review".into()),
            ..SessionFilter::default()
        };
        assert!(by_tag.matches(&s));
        let wrong_backend = SessionFilter {
            backend: Some("codex".into()),
            ..SessionFilter::default()
        };
        assert!(!wrong_backend.matches(&s));
        let wrong_status = SessionFilter {
            status: Some(SessionStatus::Completed),
            ..SessionFilter::default()
        };
        assert!(!wrong_status.matches(&s));
    }

    #[test]
    fn json_omits_empty_optionals() {
        let json = serde_json::to_value(session()).unwrap();
        assert!(json.get("parent_id").is_none());
        assert_eq!(json["status"], "active");
    }
}
