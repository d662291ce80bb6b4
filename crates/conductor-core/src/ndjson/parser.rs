//! Tolerant JSON/NDJSON readers.
//!
//! Backends print structured output with varying amounts of noise around it
//! (banners, progress lines, terminal escapes). These helpers find the JSON
//! and leave field interpretation to the backend-specific parsers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

#[allow(clippy::expect_used)]
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-Za-z]")
        .expect("static regex pattern is valid")
});

/// Parse a single NDJSON line. Non-object lines yield `None`.
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
}

/// Parse a whole captured output as one JSON document.
///
/// Tries the full text first, then falls back to the last line that holds a
/// JSON object.
pub fn parse_document(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Ok(value);
    }

    trimmed
        .lines()
        .rev()
        .find_map(parse_line)
        .ok_or_else(|| Error::OutputParse("no JSON object found in output".into()))
}

/// Iterate over every JSON object line in a captured NDJSON stream.
pub fn json_lines(raw: &str) -> impl Iterator<Item = Value> + '_ {
    raw.lines().filter_map(parse_line)
}

/// Follow `path` into nested objects and return the string found there.
pub fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    walk(value, path)?.as_str()
}

/// Follow `path` into nested objects and return the unsigned integer found there.
pub fn u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    walk(value, path)?.as_u64()
}

fn walk<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

/// Remove terminal escape sequences and carriage returns from PTY output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").replace('\r', "")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_skips_non_json() {
        assert!(parse_line("Loading model...").is_none());
        assert!(parse_line("[1, 2]").is_none());
        assert!(parse_line(r#"  {"type":"init"}  "#).is_some());
    }

    #[test]
    fn document_falls_back_to_last_object_line() {
        let raw = "warming up\n{\"a\":1}\nnoise\n{\"b\":2}\n";
        let doc = parse_document(raw).unwrap();
        assert_eq!(u64_at(&doc, &["b"]), Some(2));
    }

    #[test]
    fn document_without_json_is_an_error() {
        assert!(matches!(
            parse_document("plain text only"),
            Err(Error::OutputParse(_))
        ));
    }

    #[test]
    fn nested_lookup() {
        let doc: Value =
            serde_json::from_str(r#"{"usage":{"input_tokens":12},"item":{"text":"hi"}}"#).unwrap();
        assert_eq!(u64_at(&doc, &["usage", "input_tokens"]), Some(12));
        assert_eq!(str_at(&doc, &["item", "text"]), Some("hi"));
        assert_eq!(str_at(&doc, &["item", "missing"]), None);
    }

    #[test]
    fn strip_ansi_removes_colors_and_cr() {
        let raw = "\x1b[1;32mok\x1b[0m\r\n";
        assert_eq!(strip_ansi(raw), "ok\n");
    }

    #[test]
    fn json_lines_counts_objects() {
        let raw = "{\"type\":\"a\"}\nnot json\n{\"type\":\"b\"}\n";
        assert_eq!(json_lines(raw).count(), 2);
    }
}
