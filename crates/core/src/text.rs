//! Small helpers for cleaning model output before it is parsed or stored.

const THINK_CLOSE: &str = "</think>";

/// Keeps only the text after the last closing think tag, trimmed.
pub fn strip_think_tags(text: &str) -> &str {
    match text.rfind(THINK_CLOSE) {
        Some(index) => text[index + THINK_CLOSE.len()..].trim(),
        None => text.trim(),
    }
}

/// Unwraps the first fenced code block (three or more backticks).
///
/// The language line after the opening fence is skipped. A block without a
/// closing fence runs to the end of the text. Without any fence, a single
/// pair of surrounding backticks is removed.
pub fn extract_code_block(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return strip_single_backticks(text);
    };

    let fence_len = 3 + text[start + 3..].bytes().take_while(|byte| *byte == b'`').count();
    let after_fence = start + fence_len;
    let content_start = match text[after_fence..].find('\n') {
        Some(offset) => after_fence + offset + 1,
        None => text.len(),
    };

    let closing = "`".repeat(fence_len);
    match text[content_start..].find(&closing) {
        Some(offset) => &text[content_start..content_start + offset],
        None => &text[content_start..],
    }
}

/// Code block content flattened onto one line.
pub fn extract_code_line(text: &str) -> String {
    extract_code_block(text).replace("\r\n", " ").replace(['\n', '\r'], " ")
}

fn strip_single_backticks(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() > 1 && trimmed.starts_with('`') && trimmed.ends_with('`') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Truncates to at most `max_chars` characters, marking the cut with `...`.
pub fn abbreviate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut shortened: String = text.chars().take(max_chars - 3).collect();
    shortened.push_str("...");
    shortened
}
