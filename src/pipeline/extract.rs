//! Permissive extraction of the content block from a generation response.
//!
//! Models are asked for a single ```html fenced block but do not always
//! comply. Order of preference:
//! 1. the first ```html fenced block,
//! 2. the whole response, when it already looks like HTML,
//! 3. nothing (the caller records an extraction failure).

use once_cell::sync::Lazy;
use regex::Regex;

static RE_HTML_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```html\s*(.*?)\s*```").unwrap());

static RE_BLOCK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(?:p|div|span|table|ul|ol|h[1-6])\b").unwrap());

/// Pull the page markup out of `response`.
pub fn extract_content(response: &str) -> Option<String> {
    if let Some(caps) = RE_HTML_FENCE.captures(response) {
        let body = caps[1].trim();
        return (!body.is_empty()).then(|| body.to_string());
    }
    let trimmed = response.trim();
    if looks_like_html(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

fn looks_like_html(s: &str) -> bool {
    s.starts_with('<') && s.ends_with('>') && RE_BLOCK_TAG.is_match(s)
}
