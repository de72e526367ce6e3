//! Text preparation — transcript cleanup, markdown stripping for speech,
//! chunking for the speech endpoint, and tool-output capping.
//!
//! Pure functions, no I/O.

use regex::Regex;
use std::sync::LazyLock;

static RE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|\n)(\|[^\n]+\|(?:\n\|[^\n]+\|)*)").unwrap());
static RE_FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_HR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*_]{3,}\s*$").unwrap());
static RE_BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*").unwrap());
static RE_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*]|\d+\.)\s+").unwrap());
static RE_BLANK_AUDIO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:BLANK_AUDIO|blank_audio)\]").unwrap());
static RE_MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]{2,}").unwrap());
static RE_MULTI_NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());

/// Input limit of the speech synthesis endpoint, in bytes.
pub const MAX_SPEECH_INPUT: usize = 4096;

/// Tidy a raw transcription: drop blank-audio markers and surrounding whitespace.
pub fn normalize_transcript(raw: &str) -> String {
    let text = RE_BLANK_AUDIO.replace_all(raw, " ");
    RE_MULTI_SPACE.replace_all(text.trim(), " ").into_owned()
}

/// Strip markdown so a model answer reads naturally when spoken.
///
/// Tables and fenced code are replaced by a short spoken placeholder; inline
/// code keeps its text, since answers often quote values (`uptime`, pids).
pub fn clean_text_for_speech(text: &str) -> String {
    let mut c = RE_TABLE
        .replace_all(text, "\nThe table is shown on screen.\n")
        .into_owned();
    c = RE_FENCED_CODE
        .replace_all(&c, " The code is shown on screen. ")
        .into_owned();
    c = RE_INLINE_CODE.replace_all(&c, "$1").into_owned();
    c = RE_HR.replace_all(&c, "").into_owned();
    c = RE_BOLD.replace_all(&c, "$1").into_owned();
    c = RE_ITALIC.replace_all(&c, "$1").into_owned();
    c = RE_HEADING.replace_all(&c, "").into_owned();
    c = RE_LINK.replace_all(&c, "$1").into_owned();
    c = RE_LIST_ITEM.replace_all(&c, "").into_owned();
    c = RE_MULTI_NEWLINE.replace_all(&c, "\n").into_owned();
    c = RE_MULTI_SPACE.replace_all(&c, " ").into_owned();
    c.trim().to_string()
}

/// Largest char boundary of `s` at or below `index`.
fn floor_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split text into chunks of at most `max_len` bytes.
///
/// Prefers sentence boundaries, then word boundaries, then hard-splits on a
/// char boundary. Blank chunks are dropped.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > max_len {
        let window = &remaining[..floor_boundary(remaining, max_len)];

        let sentence_end = [". ", "! ", "? ", "\n"]
            .iter()
            .filter_map(|sep| window.rfind(sep).map(|pos| pos + 1))
            .max()
            .filter(|&pos| pos >= window.len() / 2);

        let split_at = sentence_end
            .or_else(|| window.rfind(' ').filter(|&pos| pos >= window.len() / 3))
            .unwrap_or(window.len())
            .max(1);
        // a window of one wide char still has to make progress
        let split_at = if split_at == 0 || !remaining.is_char_boundary(split_at) {
            remaining.chars().next().map_or(1, char::len_utf8)
        } else {
            split_at
        };

        let chunk = remaining[..split_at].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

/// Cap tool output before it goes back into the model context.
pub fn truncate_tool_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...\n[truncated: {total} total chars]")
}
