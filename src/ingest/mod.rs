// src/ingest/mod.rs
pub mod providers;
pub mod scheduler;
pub mod types;

use once_cell::sync::Lazy;
use regex::Regex;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Titles longer than this are cut (chars, not bytes).
pub const MAX_TITLE_CHARS: usize = 300;

/// Normalize feed text: decode HTML entities, strip tags, ASCII-fy typographic
/// quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, "");

    let quoted = stripped
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    RE_WS.replace_all(&quoted, " ").trim().to_string()
}

/// [`normalize_text`] plus the title length cap.
pub fn normalize_title(s: &str) -> String {
    let out = normalize_text(s);
    if out.chars().count() > MAX_TITLE_CHARS {
        out.chars().take(MAX_TITLE_CHARS).collect()
    } else {
        out
    }
}
