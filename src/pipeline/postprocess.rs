//! Post-processing: deterministic cleanup of generated page markup.
//!
//! Even with explicit instructions, models emit artefacts that are harmless
//! to them but wrong for the final document: `<bdi>` wrappers that confuse
//! screen readers, `<img>` tags pointing at files that do not exist,
//! Windows line endings, zero-width characters. These cheap regex/string
//! rules fix those quirks without touching content, so the prompt can stay
//! focused on *what* to extract.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so the per-line rules see `\n` only;
//! tag stripping runs before whitespace trimming so removed tags do not leave
//! trailing blanks behind.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all post-processing rules to extracted page markup.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Unwrap `<bdi>` elements, keeping their text
/// 3. Drop `<img>` tags
/// 4. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 5. Trim trailing whitespace per line
/// 6. Collapse 3+ consecutive blank lines down to 1
/// 7. Trim leading and trailing blank lines
pub fn clean_html(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_bdi(&s);
    let s = remove_img_tags(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Unwrap <bdi> ────────────────────────────────────────────────────

static RE_BDI: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?bdi\b[^>]*>").unwrap());

fn strip_bdi(input: &str) -> String {
    RE_BDI.replace_all(input, "").to_string()
}

// ── Rule 3: Drop <img> ──────────────────────────────────────────────────────
//
// Page images are never uploaded alongside the document, so any <img> the
// model emits points nowhere. The prompt asks for a textual description
// instead.

static RE_IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());

fn remove_img_tags(input: &str) -> String {
    RE_IMG.replace_all(input, "").to_string()
}

// ── Rule 4: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 5: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 6: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
