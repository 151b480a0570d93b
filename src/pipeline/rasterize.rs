//! Rasterisation: turn selected source pages into local image artifacts.
//!
//! The [`Rasterizer`] trait is synchronous because real renderers wrap C
//! libraries with thread-local state. [`rasterize_pages`] therefore runs each
//! page on `tokio::task::spawn_blocking`, keeping async worker threads free.
//!
//! [`DirectoryRasterizer`] is the bundled implementation: the "document" is a
//! directory of pre-rendered page images, sorted by file name.

use crate::cancel::CancelToken;
use crate::error::PipelineError;
use crate::progress::Reporter;
use crate::task::PageTask;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Supplies a decryption secret for a named document, if the caller has one.
pub type SecretCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Why a single page could not be rasterised.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("document '{0}' is protected and no secret was supplied")]
    SecretRequired(String),

    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("page {page} could not be decoded: {detail}")]
    Decode { page: usize, detail: String },
}

/// Renders pages of one source document.
pub trait Rasterizer: Send + Sync {
    /// Human-readable document name, used for output naming and upload labels.
    fn source_name(&self) -> String;

    fn page_count(&self) -> Result<usize, PipelineError>;

    /// Render 0-based `page_index` into `out_dir` and return the artifact path.
    ///
    /// Protected sources ask `secret` for a key and fail with
    /// [`RasterError::SecretRequired`] when none is available.
    fn rasterize(
        &self,
        page_index: usize,
        out_dir: &Path,
        secret: Option<&SecretCallback>,
    ) -> Result<PathBuf, RasterError>;
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// A directory of page images treated as a paginated document.
#[derive(Debug, Clone)]
pub struct DirectoryRasterizer {
    dir: PathBuf,
    pages: Vec<PathBuf>,
}

impl DirectoryRasterizer {
    /// Index the page images in `dir`. Non-image files are ignored.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(PipelineError::SourceNotFound { path: dir });
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| PipelineError::SourceUnreadable {
            path: dir.clone(),
            detail: e.to_string(),
        })?;

        let mut pages = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::SourceUnreadable {
                path: dir.clone(),
                detail: e.to_string(),
            })?;
            let path = entry.path();
            if path.is_file() && has_image_extension(&path) {
                pages.push(path);
            }
        }
        pages.sort();
        debug!("Indexed {} page images in {}", pages.len(), dir.display());
        Ok(Self { dir, pages })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl Rasterizer for DirectoryRasterizer {
    fn source_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    }

    fn page_count(&self) -> Result<usize, PipelineError> {
        Ok(self.pages.len())
    }

    fn rasterize(
        &self,
        page_index: usize,
        out_dir: &Path,
        _secret: Option<&SecretCallback>,
    ) -> Result<PathBuf, RasterError> {
        let src = self
            .pages
            .get(page_index)
            .ok_or(RasterError::PageOutOfRange {
                page: page_index + 1,
                total: self.pages.len(),
            })?;

        image::image_dimensions(src).map_err(|e| RasterError::Decode {
            page: page_index + 1,
            detail: e.to_string(),
        })?;

        let ext = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let dest = out_dir.join(format!("page_{:05}.{ext}", page_index + 1));
        std::fs::copy(src, &dest).map_err(|source| RasterError::Io {
            path: src.clone(),
            source,
        })?;
        Ok(dest)
    }
}

/// Rasterise every selected page, in source order, on blocking threads.
///
/// `indices` are the 0-based selected pages; a page's position in that list
/// becomes its `order_index`. Pages that fail are logged and left out, so
/// their slots stay empty downstream. Every artifact written is pushed into
/// `artifacts` as soon as it exists so cleanup can find it on any exit path.
pub async fn rasterize_pages(
    rasterizer: Arc<dyn Rasterizer>,
    indices: &[usize],
    out_dir: &Path,
    secret: Option<SecretCallback>,
    reporter: &Reporter,
    cancel: &CancelToken,
    artifacts: &mut Vec<PathBuf>,
) -> Result<Vec<PageTask>, PipelineError> {
    let total = indices.len();
    reporter.info(format!("Rasterizing {total} page(s)..."));
    let mut tasks = Vec::with_capacity(total);
    let mut first_error: Option<String> = None;

    for (order_index, &page_index) in indices.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                phase: reporter.phase(),
            });
        }
        let r = Arc::clone(&rasterizer);
        let dir = out_dir.to_path_buf();
        let cb = secret.clone();
        let outcome = tokio::task::spawn_blocking(move || r.rasterize(page_index, &dir, cb.as_ref()))
            .await
            .map_err(|e| PipelineError::Internal(format!("Rasterize task panicked: {e}")))?;

        match outcome {
            Ok(path) => {
                artifacts.push(path.clone());
                tasks.push(PageTask {
                    order_index,
                    page_number: page_index + 1,
                    artifact: path,
                });
            }
            // Every page of a protected source fails the same way.
            Err(RasterError::SecretRequired(document)) => {
                reporter.error(format!("'{document}' is protected and no secret was supplied."));
                return Err(PipelineError::SecretRequired { document });
            }
            Err(e) => {
                reporter.warn(format!("Page {} could not be rasterized: {e}", page_index + 1));
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        reporter.progress(order_index + 1, total, "Rasterizing");
    }

    if tasks.is_empty() && total > 0 {
        return Err(PipelineError::RasterisationFailed {
            attempted: total,
            first_error: first_error.unwrap_or_default(),
        });
    }
    reporter.info(format!("{} of {total} page(s) rasterized.", tasks.len()));
    Ok(tasks)
}
