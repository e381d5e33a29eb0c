//! Envelope-tolerant extraction of structured backend output.
//!
//! Agent products wrap their payloads differently: plain text around a JSON
//! object, line-delimited event records, markdown fences. Rather than assume
//! the whole output parses, scan for the first balanced-brace JSON object,
//! respecting string literals and escapes, and parse that.

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;

/// Slice of the first balanced `{...}` JSON object in `text`, if any.
///
/// Brace counting ignores braces inside string literals and skips candidate
/// objects that fail to parse (e.g. `{` inside prose), continuing the scan
/// after them.
pub fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            let candidate = &text[start..end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
            // Not valid JSON; resume the scan just past this opening brace.
        }
        search_from = start + 1;
    }
    None
}

/// Byte index one past the brace matching the `{` at `start`.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and deserialize the first JSON object in `text`.
pub fn extract<T: DeserializeOwned>(text: &str) -> Result<T> {
    let object = first_json_object(text)
        .ok_or_else(|| anyhow!("no JSON object found in backend output"))?;
    serde_json::from_str(object).context("parse extracted JSON object")
}
