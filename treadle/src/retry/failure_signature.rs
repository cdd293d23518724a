//! Deterministic-failure detection: normalize an error message into a signature
//! by substituting volatile substrings (ids, timestamps, paths, numbers), then
//! count repeats of the same signature across attempts.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid regex is valid")
});

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\b")
        .expect("timestamp regex is valid")
});

static DOUBLE_QUOTED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*/[^"]*""#).expect("double-quoted path regex is valid"));

static SINGLE_QUOTED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'[^']*/[^']*'").expect("single-quoted path regex is valid"));

static HEX_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("hex literal regex is valid"));

static HEX_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("hex token regex is valid"));

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\b").expect("digit run regex is valid"));

/// Normalizes an error message by substituting volatile substrings, most
/// specific first: UUIDs, ISO-8601 timestamps, quoted paths (double then
/// single), `0x` hex literals, standalone 8+ char tokens containing at least
/// one hex letter, then any remaining bounded digit run. Two error strings
/// that normalize to the same signature are considered the same failure.
pub fn normalize_error(message: &str) -> String {
    let s = UUID.replace_all(message, "<UUID>");
    let s = TIMESTAMP.replace_all(&s, "<TIMESTAMP>");
    let s = DOUBLE_QUOTED_PATH.replace_all(&s, "<PATH>");
    let s = SINGLE_QUOTED_PATH.replace_all(&s, "<PATH>");
    let s = HEX_LITERAL.replace_all(&s, "<HEX>");
    let s = HEX_TOKEN.replace_all(&s, |caps: &regex::Captures| {
        let token = &caps[0];
        if token.chars().any(|c| c.is_ascii_hexdigit() && !c.is_ascii_digit()) {
            "<HEX>".to_string()
        } else {
            token.to_string()
        }
    });
    let s = DIGIT_RUN.replace_all(&s, "<N>");
    s.into_owned()
}

/// Concurrent-safe per-signature failure counter. "Deterministic" means a
/// signature has recurred at least twice.
#[derive(Default)]
pub struct FailureTracker {
    counts: DashMap<String, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    /// Normalizes `raw_error`, increments its count, and returns the new total.
    pub fn record(&self, raw_error: &str) -> u32 {
        let signature = normalize_error(raw_error);
        let mut entry = self.counts.entry(signature).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Current count for the signature of `raw_error`, without recording.
    pub fn count_for(&self, raw_error: &str) -> u32 {
        let signature = normalize_error(raw_error);
        self.counts.get(&signature).map(|c| *c).unwrap_or(0)
    }

    /// True once the signature of `raw_error` has been recorded at least twice.
    pub fn is_deterministic(&self, raw_error: &str) -> bool {
        self.count_for(raw_error) >= 2
    }
}
