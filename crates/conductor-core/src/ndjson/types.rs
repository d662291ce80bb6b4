//! Normalized message types shared by every backend parser.

use serde::{Deserialize, Serialize};

/// Token usage statistics, normalized across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage report into this one.
    pub const fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }

    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub const fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cached_tokens == 0
            && self.reasoning_tokens == 0
    }
}

/// A backend's structured (non-streaming) response, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Backend-native session identifier, if the backend exposes one.
    pub session_id: Option<String>,
    /// Final assistant text.
    pub content: String,
    pub usage: Option<TokenUsage>,
    /// Error reported by the backend itself (not the process exit status).
    pub error: Option<String>,
}

impl BackendResponse {
    /// Response carrying only plain text, for output that is not structured.
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// One event observed while reading a backend's streaming output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The backend announced its session.
    Started { session_id: String },
    /// Assistant text.
    Text(String),
    /// The turn finished; usage is only known at this point.
    Done {
        session_id: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// The backend reported an error mid-stream.
    Error(String),
}
