//! Per-page instruction template for the generation service.
//!
//! Keeping the prompt here, away from the request/retry code, means the
//! instructions can change without touching the pipeline, and tests can
//! inspect them directly.
//!
//! Callers can override the template via
//! [`crate::config::PipelineConfig::prompt_template`]. Templates may use the
//! placeholders `{page}`, `{file_name}`, `{width}` and `{height}`.

/// Default instruction sent alongside every uploaded page image.
pub const DEFAULT_PAGE_PROMPT: &str = r##"Analyze the attached page image (file: {file_name}, {width}x{height} pixels, page {page} of the document) and convert it into accessible HTML body content for screen-reader users.

1. TEXT
   - Transcribe ALL readable text exactly as written, in its original language.
   - Do not paraphrase, reorder or correct the text.
   - Keep paragraph structure. Omit standalone page numbers.

2. LINKS
   - Wrap every URL in an <a> tag whose href and text are the full URL.

3. MATHEMATICS
   - Use LaTeX: \(...\) for inline math and $$...$$ for display math.
   - Wrap single-letter variables mentioned in prose in inline delimiters too.

4. TABLES
   - Use <table>, <thead>, <tbody>, <tr>, <th scope="col|row">, <td>.
   - Put the table title in a <caption> as the first child of <table>.
   - Represent merged cells with colspan and rowspan.

5. HEADINGS
   - Mark existing section titles with <h3> to <h6>. Never invent headings.
   - Give each heading id="h{LEVEL}-{page}-{INDEX}", numbering per level.

6. FIGURES
   - Do not emit <img>. Describe each meaningful figure, chart or code in
     <p><em>[Description: ...]</em></p>. Skip purely decorative elements.

7. FOOTNOTES
   - Link markers as <sup><a href="#fn{page}-{INDEX}" id="fnref{page}-{INDEX}">{MARKER}</a></sup>
     and list the notes at the end in <ol class="footnotes-list">.

8. ABBREVIATIONS
   - Expand known acronyms with <abbr title="...">.

9. OUTPUT
   - Semantic HTML only. No <bdi> tags. No commentary.
   - Return the result in a single ```html fenced code block."##;

/// Fill the template placeholders for one page.
pub fn render_page_prompt(
    template: &str,
    page: usize,
    file_name: &str,
    dimensions: Option<(u32, u32)>,
) -> String {
    let (width, height) = match dimensions {
        Some((w, h)) => (w.to_string(), h.to_string()),
        None => ("unknown".to_string(), "unknown".to_string()),
    };
    template
        .replace("{page}", &page.to_string())
        .replace("{file_name}", file_name)
        .replace("{width}", &width)
        .replace("{height}", &height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_filled() {
        let p = render_page_prompt(DEFAULT_PAGE_PROMPT, 7, "page_00007.png", Some((800, 1131)));
        assert!(p.contains("page 7 of the document"));
        assert!(p.contains("page_00007.png, 800x1131 pixels"));
        assert!(p.contains(r##"href="#fn7-{INDEX}""##));
        assert!(!p.contains("{page}"));
        assert!(!p.contains("{file_name}"));
    }

    #[test]
    fn unknown_dimensions() {
        let p = render_page_prompt("{width}x{height}", 1, "a.png", None);
        assert_eq!(p, "unknownxunknown");
    }

    #[test]
    fn default_asks_for_fenced_html() {
        assert!(DEFAULT_PAGE_PROMPT.contains("```html"));
        assert!(DEFAULT_PAGE_PROMPT.contains("[Description:"));
    }
}
