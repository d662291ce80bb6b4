//! File-per-session JSON store.
//!
//! Every session lives in `<dir>/<id>.json`. Reads take a shared
//! [`FileLock`] on the file, writes and read-modify-write cycles take an
//! exclusive one, so CLI invocations and long-running callers can share a
//! directory safely. Lock acquisition is bounded by the configured timeout.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::lock::{FileLock, LockError};

use super::types::{NewSession, Session, SessionFilter, SessionStatus};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Invalid session id: {id:?}")]
    InvalidId { id: String },

    #[error("Session store lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed session file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session directory could not be determined")]
    NoDirectory,
}

/// Lock-scoped session persistence.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl SessionStore {
    /// Default bound on waiting for a session lock.
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Open the store described by the `[sessions]` configuration section.
    pub fn from_config(config: &conductor_core::Config) -> Result<Self, StoreError> {
        let dir = config
            .sessions
            .resolved_directory()
            .ok_or(StoreError::NoDirectory)?;
        Ok(Self::open(dir)?.with_lock_timeout(config.sessions.lock_timeout()))
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create and persist a new active session with a random id.
    pub fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            backend: new.backend,
            created_at: now,
            last_used: now,
            work_dir: new.work_dir,
            backend_session_id: None,
            model: new.model,
            prompt: new.prompt,
            status: SessionStatus::Active,
            turn_count: 0,
            usage: conductor_core::TokenUsage::default(),
            tags: new.tags,
            parent_id: new.parent_id,
            error: None,
            metadata: new.metadata,
        };
        self.save(&session)?;
        info!(session_id = %session.id, backend = %session.backend, "Session created");
        Ok(session)
    }

    /// Load a session under a shared lock.
    pub fn get(&self, id: &str) -> Result<Session, StoreError> {
        let path = self.path_for(id)?;
        FileLock::new(&path).with_lock_shared_timeout(self.lock_timeout, || read_session(&path, id))
    }

    /// Persist `session`, replacing any previous version.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.id)?;
        FileLock::new(&path).with_lock_timeout(self.lock_timeout, || write_session(&path, session))
    }

    /// Read-modify-write a session under one exclusive lock.
    pub fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session),
    ) -> Result<Session, StoreError> {
        let path = self.path_for(id)?;
        FileLock::new(&path).with_lock_timeout(self.lock_timeout, || {
            let mut session = read_session(&path, id)?;
            f(&mut session);
            session.last_used = Utc::now();
            write_session(&path, &session)?;
            debug!(session_id = id, status = %session.status, "Session updated");
            Ok(session)
        })
    }

    /// Sessions matching `filter`, most recently used first.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .ids()?
            .into_iter()
            .filter_map(|id| match self.get(&id) {
                Ok(session) => Some(session),
                Err(StoreError::NotFound { .. }) => None,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping unreadable session");
                    None
                }
            })
            .filter(|s| filter.matches(s))
            .collect();

        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    /// Most recently used session, optionally restricted to one backend.
    pub fn latest(&self, backend: Option<&str>) -> Result<Option<Session>, StoreError> {
        let filter = SessionFilter {
            backend: backend.map(str::to_string),
            limit: Some(1),
            ..SessionFilter::default()
        };
        Ok(self.list(&filter)?.into_iter().next())
    }

    /// Remove a session file.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        FileLock::new(&path).with_lock_timeout(self.lock_timeout, || {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(session_id = id, "Session deleted");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                    id: id.to_string(),
                }),
                Err(e) => Err(StoreError::Io(e)),
            }
        })
    }

    /// Remove sessions unused for longer than `retention`. Returns how many were removed.
    pub fn clean(&self, retention: Duration) -> Result<usize, StoreError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for session in self.list(&SessionFilter::default())? {
            if session.last_used >= cutoff {
                continue;
            }
            match self.delete(&session.id) {
                Ok(()) | Err(StoreError::NotFound { .. }) => removed += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to remove stale session"),
            }
        }
        info!(removed, "Cleaned stale sessions");
        Ok(removed)
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && validate_id(stem).is_ok()
            {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }
}

/// Ids become file names, so only a conservative character set is accepted.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId { id: id.to_string() })
    }
}

fn read_session(path: &Path, id: &str) -> Result<Session, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    Ok(serde_json::from_str(&content)?)
}

/// Write to a sibling temp file and rename it into place.
fn write_session(path: &Path, session: &Session) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(session)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
