//! Backend output parsing primitives.
//!
//! This module holds the normalized response/event types every backend maps
//! its output into, and tolerant readers for JSON and NDJSON output.

mod parser;
mod types;

pub use parser::{json_lines, parse_document, parse_line, str_at, strip_ansi, u64_at};
pub use types::*;
