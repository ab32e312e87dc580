//! Text helpers shared by the executor, the sequencer and the history views.

use regex::Regex;
use std::sync::LazyLock;

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[\w+#.-]*[ \t]*\r?\n(.*?)```").unwrap());

/// Keep only the contents of fenced code blocks.
///
/// Several blocks are joined with a blank line. Text without any fence is
/// returned trimmed, since models sometimes answer with bare code.
pub fn extract_code_blocks(text: &str) -> String {
    let blocks: Vec<&str> = FENCED_BLOCK_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end())
        .filter(|block| !block.trim().is_empty())
        .collect();

    if blocks.is_empty() {
        text.trim().to_string()
    } else {
        blocks.join("\n\n")
    }
}

/// First line of `text`, cut to at most `max_chars` characters with a trailing `...`.
pub fn summarize(text: &str, max_chars: usize) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    if line.chars().count() <= max_chars && text.trim().lines().nth(1).is_none() {
        return line.to_string();
    }
    let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

/// Split text into pieces of at most `size` characters, on char boundaries.
pub fn chunk_text(text: &str, size: usize) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    if size == 0 {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (i, _) in text.char_indices() {
        if count == size {
            chunks.push(&text[start..i]);
            start = i;
            count = 0;
        }
        count += 1;
    }
    chunks.push(&text[start..]);
    chunks
}
