//! Patching: merge corrected pages into a previously assembled document.
//!
//! A page is an `<article class="page-content" id="page-N">` block as written
//! by [`assemble`](super::assemble). A corrections file holds one or more such
//! blocks. Each one replaces the original page with the same number, or is
//! added when the original lacks it. Pages are written back in page-number
//! order with a separator between neighbours, and the partial notice and
//! title suffix are recomputed from the placeholders that remain.

use super::assemble::{partial_notice, write_atomic, SEPARATOR};
use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

static RE_PAGE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<article\b[^>]*\bclass="page-content"[^>]*>"#).unwrap());

static RE_PAGE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bid="page-(\d+)""#).unwrap());

static RE_ARTICLE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<(/?)article\b[^>]*>").unwrap());

static RE_TRAILING_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<hr\b[^>]*\bpage-separator\b[^>]*>\s*$"#).unwrap());

static RE_NOTICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<p class="partial-notice"[^>]*>.*?</p>\n?"#).unwrap());

static RE_PARTIAL_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r" \(Partial\)(</title>|</h1>)").unwrap());

static RE_TITLE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"</title>|</h1>").unwrap());

const MISSING_MARKER: &str = "class=\"page-missing\"";

/// Why two documents could not be merged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("the original document contains no page articles")]
    NoPagesInOriginal,

    #[error("the corrections contain no page articles")]
    NoPagesInCorrections,
}

/// One page article lifted out of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBlock {
    /// 1-indexed page number from the `id="page-N"` attribute.
    pub page: usize,
    /// The article element, open tag through close tag.
    pub markup: String,
}

/// Result of [`patch_document`].
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub html: String,
    /// Pages present in the original and overwritten.
    pub replaced: Vec<usize>,
    /// Pages the original did not have.
    pub added: Vec<usize>,
    /// Pages still showing the missing-content placeholder.
    pub missing: Vec<usize>,
}

impl PatchOutcome {
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Every page article in `html`, in document order.
///
/// Articles without a numeric `page-N` id and articles that never close are
/// skipped. Nested `<article>` elements stay inside their page.
pub fn split_pages(html: &str) -> Vec<PageBlock> {
    locate_pages(html)
        .into_iter()
        .map(|(page, span)| PageBlock {
            page,
            markup: html[span].to_string(),
        })
        .collect()
}

fn locate_pages(html: &str) -> Vec<(usize, Range<usize>)> {
    let mut pages = Vec::new();
    let mut cursor = 0;
    while let Some(open) = RE_PAGE_OPEN.find_at(html, cursor) {
        let page = RE_PAGE_ID
            .captures(open.as_str())
            .and_then(|c| c[1].parse::<usize>().ok());
        let Some(page) = page else {
            cursor = open.end();
            continue;
        };
        let Some(end) = closing_tag_end(html, open.end()) else {
            break;
        };
        pages.push((page, open.start()..end));
        cursor = end;
    }
    pages
}

/// Byte offset just past the `</article>` matching an already-open article.
fn closing_tag_end(html: &str, from: usize) -> Option<usize> {
    let mut depth = 1usize;
    for caps in RE_ARTICLE_TAG.captures_iter(&html[from..]) {
        let tag = caps.get(0)?;
        if &caps[1] == "/" {
            depth -= 1;
            if depth == 0 {
                return Some(from + tag.end());
            }
        } else {
            depth += 1;
        }
    }
    None
}

/// Merge the pages of `corrections` into `original`.
///
/// Everything before the first page and after the last page of the original
/// is kept as-is, apart from the partial notice and the " (Partial)" title
/// suffix, which follow the pages that still hold a placeholder.
pub fn patch_document(original: &str, corrections: &str) -> Result<PatchOutcome, PatchError> {
    let spans = locate_pages(original);
    let (Some((_, first)), Some((_, last))) = (spans.first(), spans.last()) else {
        return Err(PatchError::NoPagesInOriginal);
    };
    let fixes = split_pages(corrections);
    if fixes.is_empty() {
        return Err(PatchError::NoPagesInCorrections);
    }

    let known: BTreeSet<usize> = spans.iter().map(|(page, _)| *page).collect();
    let mut pages: BTreeMap<usize, String> = spans
        .iter()
        .map(|(page, span)| (*page, original[span.clone()].to_string()))
        .collect();
    let mut replaced = BTreeSet::new();
    let mut added = BTreeSet::new();
    for fix in fixes {
        if known.contains(&fix.page) {
            replaced.insert(fix.page);
        } else {
            added.insert(fix.page);
        }
        pages.insert(fix.page, fix.markup);
    }

    let missing: Vec<usize> = pages
        .iter()
        .filter(|(_, markup)| markup.contains(MISSING_MARKER))
        .map(|(page, _)| *page)
        .collect();

    let head = RE_TRAILING_SEPARATOR.replace(&original[..first.start], "");
    let head = rewrite_header(&head, &missing);
    let tail = &original[last.end..];
    let body = pages
        .into_values()
        .collect::<Vec<_>>()
        .join(&format!("\n{SEPARATOR}\n"));

    let mut html = String::with_capacity(head.len() + body.len() + tail.len());
    html.push_str(&head);
    html.push_str(&body);
    html.push_str(tail);

    Ok(PatchOutcome {
        html,
        replaced: replaced.into_iter().collect(),
        added: added.into_iter().collect(),
        missing,
    })
}

fn rewrite_header(head: &str, missing: &[usize]) -> String {
    let head = RE_PARTIAL_SUFFIX.replace_all(head, "$1");
    let head = RE_NOTICE.replace(&head, "");
    if missing.is_empty() {
        return head.into_owned();
    }
    let mut head = RE_TITLE_END.replace_all(&head, " (Partial)$0").into_owned();
    let at = head
        .find("</h1>")
        .map(|i| i + "</h1>".len())
        .unwrap_or(head.len());
    head.insert_str(at, &format!("\n{}", partial_notice(missing)));
    head
}

/// `<stem>_patched.html` in `output_dir`, named after the original.
pub fn patched_path(original: &Path, output_dir: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    output_dir.join(format!("{stem}_patched.html"))
}

/// Read both documents, merge them and write the result atomically to
/// `output`.
pub async fn patch_file(
    original: &Path,
    corrections: &Path,
    output: &Path,
) -> Result<PatchOutcome, PipelineError> {
    let base = read_document(original).await?;
    let fixes = read_document(corrections).await?;
    let outcome = patch_document(&base, &fixes).map_err(|e| {
        let path = match e {
            PatchError::NoPagesInOriginal => original,
            PatchError::NoPagesInCorrections => corrections,
        };
        PipelineError::SourceUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    })?;
    write_atomic(output, &outcome.html).await?;
    debug!(
        "Patched {} ({} replaced, {} added) into {}",
        original.display(),
        outcome.replaced.len(),
        outcome.added.len(),
        output.display()
    );
    Ok(outcome)
}

async fn read_document(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::SourceNotFound {
            path: path.to_path_buf(),
        },
        _ => PipelineError::SourceUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })
}
