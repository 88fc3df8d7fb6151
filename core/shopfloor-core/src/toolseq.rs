//! Tool-sequence normalization and equality.
//!
//! Controllers format the same tool id inconsistently ("5", "05", "0005").
//! Warm-up detection and full-cycle classification both compare sequences
//! through the normalized form here, so cosmetic formatting differences
//! never cause spurious mismatches.

pub const SEQUENCE_SEPARATOR: char = ',';

/// Fixed entry width under the double-tool numbering convention.
const DOUBLE_TOOL_WIDTH: usize = 4;

/// Normalize one tool identifier.
///
/// With `double_tool` the entry is zero-padded to a fixed width (machines
/// that address paired turrets report "0102" style ids); otherwise leading
/// zeros are stripped so "05" and "5" compare equal.
pub fn normalize_entry(tool: &str, double_tool: bool) -> String {
    let trimmed = tool.trim();
    if double_tool {
        if trimmed.len() >= DOUBLE_TOOL_WIDTH {
            return trimmed.to_string();
        }
        format!("{:0>width$}", trimmed, width = DOUBLE_TOOL_WIDTH)
    } else {
        let stripped = trimmed.trim_start_matches('0');
        if stripped.is_empty() && !trimmed.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        }
    }
}

pub fn normalize_sequence(entries: &[String], double_tool: bool) -> Vec<String> {
    entries
        .iter()
        .map(|entry| normalize_entry(entry, double_tool))
        .collect()
}

/// Canonical comparison key for a sequence: normalized entries joined by the
/// separator. An empty sequence yields an empty key.
pub fn sequence_key(entries: &[String], double_tool: bool) -> String {
    normalize_sequence(entries, double_tool).join(&SEQUENCE_SEPARATOR.to_string())
}

/// Parse a stored separator-joined sequence back into entries.
pub fn split_sequence(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined
        .split(SEQUENCE_SEPARATOR)
        .map(|part| part.to_string())
        .collect()
}

pub fn sequences_match(a: &[String], b: &[String], double_tool: bool) -> bool {
    sequence_key(a, double_tool) == sequence_key(b, double_tool)
}

/// Append a tool to an open cycle's sequence, skipping consecutive
/// duplicates. Returns true when the sequence grew.
pub fn append_tool(sequence: &mut Vec<String>, tool: &str) -> bool {
    let tool = tool.trim();
    if tool.is_empty() {
        return false;
    }
    if sequence.last().map(|last| last == tool).unwrap_or(false) {
        return false;
    }
    sequence.push(tool.to_string());
    true
}
