//! Assembly: merge the ordered, possibly sparse, page results into one HTML
//! document and write it atomically.

use crate::error::PipelineError;
use crate::output::ArtifactLocator;
use crate::task::ResultBuffer;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Marker the page prompt uses for figure descriptions.
pub const DESCRIPTION_MARKER: &str = "[Description:";

pub(crate) const SEPARATOR: &str = "<hr class=\"page-separator\" aria-hidden=\"true\">";

/// Where and how to write the document.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub output_dir: PathBuf,
    pub stem: String,
    pub title: String,
    pub embed_previews: bool,
}

impl AssemblyOptions {
    /// Output path for a complete or a partial document.
    pub fn path_for(&self, partial: bool) -> PathBuf {
        let name = if partial {
            format!("{}_partial.html", self.stem)
        } else {
            format!("{}.html", self.stem)
        };
        self.output_dir.join(name)
    }
}

/// Render the buffer and write it to disk.
///
/// Empty slots become placeholders. With fewer populated slots than slots
/// the artifact is flagged partial and written under a distinct name. With
/// no populated slot nothing is written.
pub async fn assemble(
    buffer: &ResultBuffer,
    options: &AssemblyOptions,
) -> Result<ArtifactLocator, PipelineError> {
    let populated = buffer.populated();
    let total = buffer.len();
    if populated == 0 {
        return Err(PipelineError::AllPagesFailed {
            attempted: total,
            rounds: 0,
            first_error: "no page content to assemble".into(),
        });
    }
    let partial = populated < total;
    let html = render_document(buffer, &options.title, partial, options.embed_previews);
    let path = options.path_for(partial);
    write_atomic(&path, &html).await?;
    debug!("Wrote {} bytes to {}", html.len(), path.display());
    Ok(ArtifactLocator {
        path,
        partial,
        pages_rendered: populated,
        pages_total: total,
    })
}

/// Build the full HTML document.
pub fn render_document(buffer: &ResultBuffer, title: &str, partial: bool, embed_previews: bool) -> String {
    let title = if partial {
        format!("{title} (Partial)")
    } else {
        title.to_string()
    };
    let title = escape_html(&title);

    let mut out = String::with_capacity(4096);
    out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    let _ = writeln!(out, "<title>{title}</title>");
    out.push_str("</head>\n<body>\n<main>\n");
    let _ = writeln!(out, "<h1>{title}</h1>");

    if partial {
        let _ = writeln!(out, "{}", partial_notice(&buffer.missing_pages()));
    }

    let mut first = true;
    for (_, page, content) in buffer.iter() {
        if !first {
            out.push_str(SEPARATOR);
            out.push('\n');
        }
        first = false;

        let _ = writeln!(
            out,
            "<article class=\"page-content\" id=\"page-{page}\" aria-labelledby=\"page-heading-{page}\">"
        );
        let _ = writeln!(out, "<h2 id=\"page-heading-{page}\">Page {page}</h2>");
        match content {
            Some(c) => {
                out.push_str(&c.body);
                out.push('\n');
                if embed_previews && c.body.contains(DESCRIPTION_MARKER) {
                    if let Some(preview) = &c.preview {
                        out.push_str(&preview_block(page, preview));
                    }
                }
            }
            None => {
                let _ = writeln!(out, "{}", placeholder(page));
            }
        }
        out.push_str("</article>\n");
    }

    out.push_str("</main>\n</body>\n</html>\n");
    out
}

/// Notice listing the pages a partial document lacks.
pub(crate) fn partial_notice(missing: &[usize]) -> String {
    let pages: Vec<String> = missing.iter().map(|p| p.to_string()).collect();
    format!(
        "<p class=\"partial-notice\" role=\"note\">This document is incomplete. Content could not be extracted for page(s): {}.</p>",
        pages.join(", ")
    )
}

/// Paragraph rendered in place of a page with no content.
pub fn placeholder(page: usize) -> String {
    format!("<p class=\"page-missing\"><i>[Content could not be extracted for page {page}.]</i></p>")
}

fn preview_block(page: usize, preview: &str) -> String {
    format!(
        "<details class=\"original-page-viewer\">\n<summary>View original page {page}</summary>\n\
         <img src=\"data:{};base64,{preview}\" alt=\"Original image of page {page}\" loading=\"lazy\">\n\
         </details>\n",
        preview_mime(preview)
    )
}

fn preview_mime(b64: &str) -> &'static str {
    if b64.starts_with("/9j/") {
        "image/jpeg"
    } else {
        "image/png"
    }
}

/// Escape text for use in HTML element content and attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Write via a sibling temp file and rename, so readers never see a
/// half-written document.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<(), PipelineError> {
    let fail = |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await.map_err(fail)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(fail(e));
    }
    Ok(())
}
