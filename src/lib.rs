//! # edgequake-pdf2html
//!
//! Convert paginated documents into a single accessible HTML file using a
//! remote vision model.
//!
//! ## Why this crate?
//!
//! Text-layer extraction loses reading order, tables, and everything drawn
//! as an image. Instead this crate rasterises each page, uploads the images
//! to the model provider's file store, and asks the model to transcribe each
//! page into semantic HTML with descriptions of figures. The per-page results
//! are merged, in page order, into one standalone document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source
//!  │
//!  ├─ 1. Select     parse the page range ("1-3,5,7-")
//!  ├─ 2. Rasterize  one image per page (blocking threads)
//!  ├─ 3. Upload     bounded pool, poll until active, retry failed items
//!  ├─ 4. Generate   bounded pool, escalate truncated pages, retry failed items
//!  ├─ 5. Assemble   ordered merge, placeholders for missing pages
//!  └─ 6. Cleanup    local files + every remote handle, on every exit path
//! ```
//!
//! A finished document can later take corrected pages with
//! [`patch_file`], which replaces or adds `page-N` articles and keeps page order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2html::{convert, CancelToken, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads GOOGLE_API_KEY
//!     let config = PipelineConfig::builder().page_range("1-5").build()?;
//!     let output = convert("scans/", config, CancelToken::new()).await?;
//!     println!("{}", output.locator.path.display());
//!     if output.locator.partial {
//!         eprintln!("only {} of {} pages", output.locator.pages_rendered, output.locator.pages_total);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2html` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2html = { version = "0.1", default-features = false }
//! ```
//!
//! ## Custom Backends
//!
//! Rasterisation, the remote file store, and the generation service are
//! traits ([`Rasterizer`], [`RemoteStore`], [`GenerationService`]). Build a
//! [`Pipeline`] from any implementations through [`Backends`]; the bundled
//! [`GeminiClient`] implements both remote traits.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod remote;
pub mod stream;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{GenerationProfile, PipelineConfig, PipelineConfigBuilder, RetryPolicy};
pub use convert::{convert, Backends, Pipeline};
pub use error::{ErrorKind, FailureReason, PipelineError, RemoteError};
pub use output::{ArtifactLocator, CleanupReport, PipelineOutput, RunStats};
pub use pipeline::patch::{patch_document, patch_file, PatchError, PatchOutcome};
pub use pipeline::rasterize::{DirectoryRasterizer, RasterError, Rasterizer, SecretCallback};
pub use progress::{Completion, NoopObserver, PipelineObserver, Progress, Reporter, StatusLevel, StatusLine};
pub use remote::{GeminiClient, GenerationService, RemoteHandle, RemoteStore};
pub use stream::{spawn_with_events, EventStream, PipelineEvent};
pub use task::Phase;
