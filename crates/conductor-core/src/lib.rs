//! Conductor Core Library
//!
//! Shared functionality for Conductor components:
//! - Normalized backend output types and tolerant JSON/NDJSON readers
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use ndjson::{BackendResponse, StreamEvent, TokenUsage};
