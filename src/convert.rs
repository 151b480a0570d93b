//! Run orchestration: one [`Pipeline::run`] drives every phase in order and
//! always finishes with cleanup.
//!
//! ```text
//! parse range ─▶ rasterize ─▶ upload ─▶ generate ─▶ assemble
//!       │            │           │          │           │
//!       └────────────┴───────────┴──────────┴───────────┴──▶ cleanup ─▶ completion signal
//! ```
//!
//! A phase that fails, is cancelled, or panics ends the run early, but the
//! cleanup phase and the single completion signal happen on every path.

use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{ArtifactLocator, PipelineOutput, RunStats};
use crate::pipeline::assemble::{assemble, AssemblyOptions};
use crate::pipeline::cleanup::{cleanup, CleanupJob};
use crate::pipeline::generate::GenerationCoordinator;
use crate::pipeline::rasterize::{rasterize_pages, DirectoryRasterizer, Rasterizer, SecretCallback};
use crate::pipeline::select::parse_page_range;
use crate::pipeline::upload::UploadCoordinator;
use crate::progress::{Completion, NoopObserver, PipelineObserver, Reporter};
use crate::remote::{GeminiClient, GenerationService, HandleRegistry, RemoteStore};
use crate::task::{GenerationTask, Phase, ResultBuffer};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info};

/// The external collaborators a run delegates to.
#[derive(Clone)]
pub struct Backends {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub store: Arc<dyn RemoteStore>,
    pub generator: Arc<dyn GenerationService>,
    /// Asked for a decryption secret when the source is protected.
    pub secret: Option<SecretCallback>,
}

/// A configured, reusable document-to-HTML pipeline.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2html::{Backends, CancelToken, DirectoryRasterizer, GeminiClient, Pipeline, PipelineConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Arc::new(GeminiClient::from_env()?);
/// let backends = Backends {
///     rasterizer: Arc::new(DirectoryRasterizer::open("scans/")?),
///     store: client.clone(),
///     generator: client,
///     secret: None,
/// };
/// let config = PipelineConfig::builder().page_range("1-3").build()?;
/// let output = Pipeline::new(config, backends).run(CancelToken::new()).await?;
/// println!("{}", output.locator.path.display());
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    backends: Backends,
    observer: Arc<dyn PipelineObserver>,
}

/// State owned by one run, from start until cleanup has finished.
struct PipelineRun {
    id: String,
    cancel: CancelToken,
    reporter: Reporter,
    registry: Arc<HandleRegistry>,
    work_dir: Option<TempDir>,
    local_artifacts: Vec<PathBuf>,
    results: Option<ResultBuffer>,
    stats: RunStats,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backends: Backends) -> Self {
        Self {
            config,
            backends,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replace the observer that receives status, progress and completion.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run.
    ///
    /// Returns the artifact locator (complete or partial) on success. Every
    /// exit path, including a panic inside a phase, runs cleanup and emits
    /// exactly one completion signal before returning.
    pub async fn run(&self, cancel: CancelToken) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();
        let reporter = Reporter::new(Arc::clone(&self.observer));
        let mut run = PipelineRun {
            id: uuid::Uuid::new_v4().to_string(),
            cancel,
            reporter: reporter.clone(),
            registry: Arc::new(HandleRegistry::new()),
            work_dir: None,
            local_artifacts: Vec::new(),
            results: None,
            stats: RunStats::default(),
        };
        info!(run_id = %run.id, "Starting run for '{}'", self.backends.rasterizer.source_name());
        debug!("Config: {:?}", self.config);

        let outcome = match AssertUnwindSafe(self.execute(&mut run)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(PipelineError::Internal(format!(
                "{} phase panicked: {}",
                reporter.phase(),
                panic_message(&*panic)
            ))),
        };

        reporter.enter(Phase::Cleanup);
        let cleanup_report = cleanup(
            CleanupJob {
                local_artifacts: std::mem::take(&mut run.local_artifacts),
                work_dir: run.work_dir.take(),
                registry: Arc::clone(&run.registry),
                store: Arc::clone(&self.backends.store),
                delete_spacing: self.config.delete_spacing,
            },
            &reporter,
        )
        .await;
        run.stats.total_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(locator) => {
                let completion = if locator.partial {
                    reporter.warn(format!(
                        "Partial document written to {} ({} of {} pages).",
                        locator.path.display(),
                        locator.pages_rendered,
                        locator.pages_total
                    ));
                    Completion::Partial {
                        locator: locator.clone(),
                    }
                } else {
                    reporter.info(format!("Document written to {}.", locator.path.display()));
                    Completion::Complete {
                        locator: locator.clone(),
                    }
                };
                reporter.complete(&completion);
                Ok(PipelineOutput {
                    run_id: run.id,
                    locator,
                    stats: run.stats,
                    cleanup: cleanup_report,
                    status_log: reporter.snapshot(),
                })
            }
            Err(e) => {
                let completion = if e.is_cancellation() {
                    reporter.warn("Run cancelled.");
                    Completion::Cancelled
                } else {
                    reporter.error(format!("Run failed: {e}"));
                    Completion::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                };
                reporter.complete(&completion);
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<ArtifactLocator, PipelineError> {
        let config = &self.config;
        let reporter = run.reporter.clone();
        let document = self.backends.rasterizer.source_name();

        // ── Selection ────────────────────────────────────────────────────
        reporter.enter(Phase::Rasterization);
        let total = self.backends.rasterizer.page_count()?;
        if total == 0 {
            return Err(PipelineError::EmptyDocument);
        }
        let indices = parse_page_range(&config.page_range, total)
            .map_err(|e| e.into_pipeline_error(&config.page_range))?;
        run.stats.source_pages = total;
        run.stats.selected_pages = indices.len();
        run.results = Some(ResultBuffer::new(indices.iter().map(|i| i + 1)));
        reporter.info(format!(
            "'{document}': {} of {total} page(s) selected.",
            indices.len()
        ));

        // ── Rasterization ────────────────────────────────────────────────
        let phase_start = Instant::now();
        let work_dir = create_work_dir(config.work_dir_root.as_deref())?;
        let out_dir = work_dir.path().to_path_buf();
        run.work_dir = Some(work_dir);
        let pages = rasterize_pages(
            Arc::clone(&self.backends.rasterizer),
            &indices,
            &out_dir,
            self.backends.secret.clone(),
            &reporter,
            &run.cancel,
            &mut run.local_artifacts,
        )
        .await?;
        run.stats.rasterized_pages = pages.len();
        run.stats.rasterize_ms = phase_start.elapsed().as_millis() as u64;
        check_cancel(&run.cancel, Phase::Rasterization)?;

        // ── Upload ───────────────────────────────────────────────────────
        reporter.enter(Phase::Upload);
        let phase_start = Instant::now();
        let uploader = UploadCoordinator::new(
            Arc::clone(&self.backends.store),
            Arc::clone(&run.registry),
            config,
            document.clone(),
            reporter.clone(),
            run.cancel.clone(),
        );
        let artifacts: Vec<PathBuf> = pages.iter().map(|p| p.artifact.clone()).collect();
        let uploads = uploader.upload(&artifacts).await?;
        run.stats.uploaded_pages = uploads.survivors();
        run.stats.upload_rounds = uploads.rounds;
        run.stats.upload_ms = phase_start.elapsed().as_millis() as u64;
        check_cancel(&run.cancel, Phase::Upload)?;

        // ── Generation ───────────────────────────────────────────────────
        reporter.enter(Phase::Generation);
        let phase_start = Instant::now();
        let tasks: Vec<GenerationTask> = pages
            .iter()
            .filter_map(|p| {
                uploads.handles.get(&p.artifact).map(|h| GenerationTask {
                    order_index: p.order_index,
                    page_number: p.page_number,
                    handle: h.clone(),
                    artifact: p.artifact.clone(),
                    profile: config.profile.clone(),
                })
            })
            .collect();
        let buffer = run
            .results
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("result buffer missing".into()))?;
        let generator = GenerationCoordinator::new(
            Arc::clone(&self.backends.generator),
            config,
            reporter.clone(),
            run.cancel.clone(),
        );
        let generated = generator.generate(tasks, buffer).await?;
        run.stats.generated_pages = buffer.populated();
        run.stats.generation_rounds = generated.rounds;
        run.stats.escalated_pages = generated.escalated;
        run.stats.generation_ms = phase_start.elapsed().as_millis() as u64;
        check_cancel(&run.cancel, Phase::Generation)?;

        // ── Assembly ─────────────────────────────────────────────────────
        reporter.enter(Phase::Assembly);
        let phase_start = Instant::now();
        let stem = config
            .output_stem
            .clone()
            .unwrap_or_else(|| sanitize_stem(&document));
        let options = AssemblyOptions {
            output_dir: config.output_dir.clone(),
            title: config.title.clone().unwrap_or_else(|| stem.clone()),
            stem,
            embed_previews: config.embed_previews,
        };
        reporter.info(format!(
            "Assembling {} of {} page(s)...",
            buffer.populated(),
            buffer.len()
        ));
        let locator = assemble(buffer, &options).await?;
        reporter.progress(1, 1, "Assembling");
        run.stats.assembly_ms = phase_start.elapsed().as_millis() as u64;
        Ok(locator)
    }
}

/// Convert a directory of page images with the Gemini backend.
///
/// `GOOGLE_API_KEY` must be set; its absence is reported before any other
/// work is attempted.
pub async fn convert(
    source_dir: impl AsRef<Path>,
    config: PipelineConfig,
    cancel: CancelToken,
) -> Result<PipelineOutput, PipelineError> {
    let client = Arc::new(GeminiClient::from_env()?);
    let backends = Backends {
        rasterizer: Arc::new(DirectoryRasterizer::open(source_dir)?),
        store: client.clone(),
        generator: client,
        secret: None,
    };
    Pipeline::new(config, backends).run(cancel).await
}

fn check_cancel(cancel: &CancelToken, phase: Phase) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled { phase })
    } else {
        Ok(())
    }
}

fn create_work_dir(root: Option<&Path>) -> Result<TempDir, PipelineError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("pdf2html-");
    match root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(PipelineError::WorkDir)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .map_err(PipelineError::WorkDir)
}

/// File-system-safe stem derived from a document name.
pub(crate) fn sanitize_stem(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
