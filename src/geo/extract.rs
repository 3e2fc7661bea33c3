//! Place-name candidates: the extraction seam plus the filter every candidate
//! list goes through before anything is geocoded.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

/// Pulls candidate place names out of free text, most likely first.
#[async_trait]
pub trait PlaceExtractor: Send + Sync {
    async fn extract_places(&self, text: &str) -> Result<Vec<String>>;
}

static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("url regex"));
static RE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?u)\p{Lu}[\p{L}'\-]+(?:\s+\p{Lu}[\p{L}'\-]+)*").expect("phrase regex")
});

/// Words that put the following phrase to the front of the candidate list.
const LOCATIVES: &[&str] = &["in", "near", "at", "off", "from", "across", "outside"];

/// Regex heuristic: runs of capitalized words, with runs right after a locative
/// preposition ("near Los Angeles") ranked first. Hashtag/mention bodies and URLs
/// are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapitalizedPhraseExtractor;

impl CapitalizedPhraseExtractor {
    pub fn extract(text: &str) -> Vec<String> {
        let cleaned = RE_URL.replace_all(text, " ");
        let mut preferred = Vec::new();
        let mut rest = Vec::new();

        for m in RE_PHRASE.find_iter(&cleaned) {
            let before = &cleaned[..m.start()];
            if matches!(before.chars().last(), Some('#') | Some('@')) {
                continue;
            }
            // Word boundary: the run must not start mid-word.
            if before.chars().last().is_some_and(char::is_alphanumeric) {
                continue;
            }
            let prev_word = before
                .split_whitespace()
                .last()
                .map(|w| w.to_lowercase())
                .unwrap_or_default();
            if LOCATIVES.contains(&prev_word.as_str()) {
                preferred.push(m.as_str().to_string());
            } else {
                rest.push(m.as_str().to_string());
            }
        }

        preferred.extend(rest);
        preferred
    }
}

#[async_trait]
impl PlaceExtractor for CapitalizedPhraseExtractor {
    async fn extract_places(&self, text: &str) -> Result<Vec<String>> {
        Ok(Self::extract(text))
    }
}

/// Check if a word is a common stop word or a feed boilerplate word that is
/// often capitalized but never a place.
pub fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "or" | "but" | "in" | "on" | "at" | "to" | "for" | "of" | "with" | "by"
            | "a" | "an" | "is" | "are" | "was" | "were" | "be" | "been" | "has" | "have"
            | "this" | "that" | "these" | "those" | "it" | "its" | "new" | "just" | "now"
            | "today" | "yesterday" | "breaking" | "update" | "updated" | "news" | "live"
            | "alert" | "warning" | "watch" | "report" | "reports" | "magnitude"
            | "earthquake" | "quake" | "flood" | "fire" | "storm" | "monday" | "tuesday"
            | "wednesday" | "thursday" | "friday" | "saturday" | "sunday"
    )
}

fn is_url(s: &str) -> bool {
    let l = s.to_ascii_lowercase();
    l.contains("://") || l.starts_with("www.")
}

fn is_numeric(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || ".,:;+-/%°".contains(c))
}

/// Trim, drop junk (short tokens, stop words, URLs, hashtags/mentions, numbers),
/// de-duplicate case-insensitively keeping first occurrence, keep at most `max`.
pub fn filter_candidates(raw: Vec<String>, max: usize, min_len: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cand in raw {
        if out.len() >= max {
            break;
        }
        let c = cand
            .trim()
            .trim_end_matches(|ch: char| ".,;:!?".contains(ch))
            .trim();
        if c.chars().count() < min_len
            || c.starts_with('#')
            || c.starts_with('@')
            || is_url(c)
            || is_numeric(c)
            || is_stop_word(&c.to_lowercase())
        {
            continue;
        }
        if seen.insert(c.to_lowercase()) {
            out.push(c.to_string());
        }
    }
    out
}
