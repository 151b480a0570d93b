//! Page selection: parse a page-range string into 0-based page indices.
//!
//! Grammar: comma-separated tokens, each `N`, `A-B` (inclusive) or `A-`
//! (through the last page). Page numbers are 1-based. The parse is
//! all-or-nothing: one bad token rejects the whole input.

use crate::error::PipelineError;
use std::collections::BTreeSet;
use thiserror::Error;

/// Why a page-range string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageRangeError {
    #[error("malformed token '{0}'")]
    Malformed(String),
    #[error("reversed range '{0}'")]
    Reversed(String),
    #[error("page {page} is out of bounds (document has {total} pages)")]
    OutOfBounds { page: usize, total: usize },
    #[error("no pages selected")]
    Empty,
}

impl PageRangeError {
    pub fn into_pipeline_error(self, input: &str) -> PipelineError {
        PipelineError::InvalidPageRange {
            input: input.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Parse `range` against a document of `total` pages.
///
/// Returns a strictly increasing list of 0-based indices in `[0, total)`.
/// An empty (or whitespace-only) string selects every page. Blank tokens
/// between commas are skipped, but a non-empty string that selects nothing
/// is an error.
///
/// ```rust
/// use edgequake_pdf2html::pipeline::select::parse_page_range;
///
/// assert_eq!(
///     parse_page_range("1-3,5,7-", 10).unwrap(),
///     vec![0, 1, 2, 4, 6, 7, 8, 9]
/// );
/// assert!(parse_page_range("3-1", 10).is_err());
/// ```
pub fn parse_page_range(range: &str, total: usize) -> Result<Vec<usize>, PageRangeError> {
    if range.trim().is_empty() {
        return Ok((0..total).collect());
    }

    let mut selected = BTreeSet::new();
    for raw in range.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => {
                let start = page_number(a, token)?;
                let end = if b.trim().is_empty() {
                    if total == 0 {
                        return Err(PageRangeError::OutOfBounds { page: start, total });
                    }
                    total
                } else {
                    page_number(b, token)?
                };
                if start > end {
                    return Err(PageRangeError::Reversed(token.to_string()));
                }
                (start, end)
            }
            None => {
                let p = page_number(token, token)?;
                (p, p)
            }
        };
        for page in [start, end] {
            if page > total {
                return Err(PageRangeError::OutOfBounds { page, total });
            }
        }
        selected.extend(start - 1..end);
    }

    if selected.is_empty() {
        return Err(PageRangeError::Empty);
    }
    Ok(selected.into_iter().collect())
}

fn page_number(s: &str, token: &str) -> Result<usize, PageRangeError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PageRangeError::Malformed(token.to_string()));
    }
    match s.parse::<usize>() {
        Ok(0) | Err(_) => Err(PageRangeError::Malformed(token.to_string())),
        Ok(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_tokens() {
        assert_eq!(
            parse_page_range("1-3,5,7-", 10).unwrap(),
            vec![0, 1, 2, 4, 6, 7, 8, 9]
        );
    }

    #[test]
    fn empty_selects_all() {
        assert_eq!(parse_page_range("", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_page_range("   ", 2).unwrap(), vec![0, 1]);
        assert!(parse_page_range("", 0).unwrap().is_empty());
    }

    #[test]
    fn overlapping_tokens_dedup_and_sort() {
        assert_eq!(parse_page_range("5,1-3,2,3-4", 6).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(parse_page_range(" 2 , 2 ", 3).unwrap(), vec![1]);
    }

    #[test]
    fn one_bad_token_rejects_everything() {
        assert_eq!(
            parse_page_range("1,2,x", 5),
            Err(PageRangeError::Malformed("x".into()))
        );
        assert_eq!(
            parse_page_range("1,4-2", 5),
            Err(PageRangeError::Reversed("4-2".into()))
        );
        assert_eq!(
            parse_page_range("1,9", 5),
            Err(PageRangeError::OutOfBounds { page: 9, total: 5 })
        );
        assert!(parse_page_range("0", 5).is_err());
        assert!(parse_page_range("-3", 5).is_err());
        assert!(parse_page_range("1-2-3", 5).is_err());
        assert!(parse_page_range("+2", 5).is_err());
    }

    #[test]
    fn open_range_beyond_end_is_out_of_bounds() {
        assert_eq!(
            parse_page_range("7-", 5),
            Err(PageRangeError::OutOfBounds { page: 7, total: 5 })
        );
        assert_eq!(parse_page_range("5-", 5).unwrap(), vec![4]);
    }

    #[test]
    fn only_commas_is_empty_selection() {
        assert_eq!(parse_page_range(",,", 5), Err(PageRangeError::Empty));
    }

    #[test]
    fn converts_to_configuration_error() {
        let err = parse_page_range("3-1", 5)
            .unwrap_err()
            .into_pipeline_error("3-1");
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
