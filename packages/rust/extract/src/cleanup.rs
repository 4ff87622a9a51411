//! Post-extraction cleanup pipeline for page text.
//!
//! Each cleanup pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Marker appended when text is cut to the length bound.
pub const TRUNCATION_MARKER: &str = "...";

/// Run the full cleanup pipeline. Output never exceeds `max_chars` characters.
pub(crate) fn run_pipeline(text: &str, max_chars: usize) -> String {
    let mut result = strip_leftover_markup(text);
    result = drop_entity_residue(&result);
    result = collapse_whitespace(&result);
    truncate_chars(&result, max_chars)
}

// ---------------------------------------------------------------------------
// Pass 1: Strip leftover markup
// ---------------------------------------------------------------------------

/// Remove tag-like fragments that survived extraction, e.g. from
/// HTML-escaped markup inside text nodes or `<!-- -->` comments in raw text.
fn strip_leftover_markup(text: &str) -> String {
    static COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?[a-zA-Z][a-zA-Z0-9-]*(?:\s[^<>]{0,500})?/?>").expect("valid regex")
    });

    let without_comments = COMMENT_RE.replace_all(text, " ");
    TAG_RE.replace_all(&without_comments, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Drop undecoded entities
// ---------------------------------------------------------------------------

/// The parser decodes entities in text nodes; double-escaped ones like
/// `&amp;nbsp;` come through as `&nbsp;` and read as noise.
fn drop_entity_residue(text: &str) -> String {
    static ENTITY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"&(?:nbsp|zwnj|zwj|shy|#8203);").expect("valid regex"));

    ENTITY_RE.replace_all(text, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 3: Collapse whitespace
// ---------------------------------------------------------------------------

/// Collapse every whitespace run (newlines included) to a single space.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Pass 4: Truncate
// ---------------------------------------------------------------------------

/// Cut to at most `max_chars` characters, marker included, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }

    let keep = max_chars - marker_len;
    let mut out: String = text.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push_str(TRUNCATION_MARKER);
    out
}
