//! CLI binary for edgequake-pdf2html.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, renders progress, and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2html::pipeline::patch::patched_path;
use edgequake_pdf2html::{
    patch_file, Backends, CancelToken, Completion, DirectoryRasterizer, GeminiClient, GenerationProfile,
    Pipeline, PipelineConfig, PipelineError, PipelineObserver, Progress, StatusLevel, StatusLine,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Terminal observer using indicatif ────────────────────────────────────────

/// Renders one bar for the whole run (0–100 %) and prints warnings and
/// errors above it. Info lines are shown only with `--verbose`.
struct CliObserver {
    bar: ProgressBar,
    verbose: bool,
}

impl CliObserver {
    fn new(verbose: bool) -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:>10}  [{bar:42.green/238}] {pos:>3}%  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar, verbose })
    }
}

impl PipelineObserver for CliObserver {
    fn on_status(&self, line: &StatusLine) {
        match line.level {
            StatusLevel::Error => self.bar.println(format!("  {} {}", red("✗"), line)),
            StatusLevel::Warn => self.bar.println(format!("  {} {}", yellow("⚠"), line)),
            StatusLevel::Info if self.verbose => self.bar.println(format!("  {}", dim(&line.to_string()))),
            StatusLevel::Info => {}
        }
    }

    fn on_progress(&self, progress: &Progress) {
        self.bar.set_prefix(progress.phase.to_string());
        self.bar.set_message(format!(
            "{} {}/{}",
            progress.label, progress.completed, progress.total
        ));
        self.bar.set_position(progress.overall_percent() as u64);
    }

    fn on_complete(&self, completion: &Completion, _status_log: &[StatusLine]) {
        self.bar.finish_and_clear();
        match completion {
            Completion::Complete { locator } => eprintln!(
                "{} {} pages  →  {}",
                green("✔"),
                bold(&locator.pages_rendered.to_string()),
                bold(&locator.path.display().to_string())
            ),
            Completion::Partial { locator } => eprintln!(
                "{} {}/{} pages (partial)  →  {}",
                yellow("⚠"),
                bold(&locator.pages_rendered.to_string()),
                locator.pages_total,
                bold(&locator.path.display().to_string())
            ),
            Completion::Failed { message, .. } => eprintln!("{} {}", red("✘"), message),
            Completion::Cancelled => eprintln!("{} cancelled", yellow("■")),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a directory of page scans
  pdf2html scans/ -o out/

  # Selected pages only, custom name and title
  pdf2html scans/ --pages 1-3,5,7- --stem report --title "Annual Report"

  # Smaller pools for a low rate limit
  pdf2html scans/ --upload-workers 3 --generation-workers 2

  # Machine-readable summary
  pdf2html scans/ --json > run.json

  # Merge corrected pages into an earlier output
  pdf2html out/report_partial.html --patch fixes.html -o out/

PAGE RANGES:
  Comma-separated tokens, 1-based and inclusive:
    5      a single page
    2-4    pages 2, 3 and 4
    7-     page 7 to the end
  Empty selects every page.

OUTPUT:
  <stem>.html when every selected page converted, <stem>_partial.html
  otherwise. Missing pages are replaced by a placeholder.
  With --patch: <original stem>_patched.html.

ENVIRONMENT VARIABLES:
  GOOGLE_API_KEY          Gemini API key (required)
  PDF2HTML_*              Any flag, e.g. PDF2HTML_PAGES=1-5
  RUST_LOG                Override log filtering

Press Ctrl-C to cancel; uploaded files are still deleted before exit.
"#;

/// Convert paginated documents to accessible HTML using a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2html",
    version,
    about = "Convert paginated documents to accessible HTML using a vision model",
    long_about = "Rasterise each page, upload the images to the Gemini file store, transcribe \
every page to semantic HTML with figure descriptions, and merge the pages into one \
standalone document. Uploads and generation run in bounded concurrent pools with \
per-item retry rounds.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory of page images (png/jpg), one file per page in name order.
    /// With --patch, the HTML document to correct.
    input: PathBuf,

    /// Merge the page articles of this HTML file into INPUT instead of converting.
    #[arg(long, value_name = "CORRECTIONS")]
    patch: Option<PathBuf>,

    /// Directory to write the HTML file to.
    #[arg(short, long, env = "PDF2HTML_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Output file stem. Defaults to the input directory name.
    #[arg(long, env = "PDF2HTML_STEM")]
    stem: Option<String>,

    /// Document title. Defaults to the stem.
    #[arg(long, env = "PDF2HTML_TITLE")]
    title: Option<String>,

    /// Page range, e.g. 1-3,5,7-. Empty selects every page.
    #[arg(long, env = "PDF2HTML_PAGES", default_value = "")]
    pages: String,

    /// Gemini API key.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model for the first attempt at every page.
    #[arg(long, env = "PDF2HTML_MODEL")]
    model: Option<String>,

    /// Model used when a page's response was truncated.
    #[arg(long, env = "PDF2HTML_ESCALATION_MODEL")]
    escalation_model: Option<String>,

    /// Output token limit for the escalation model.
    #[arg(long, env = "PDF2HTML_ESCALATION_MAX_TOKENS")]
    escalation_max_tokens: Option<u32>,

    /// Sampling temperature.
    #[arg(long, env = "PDF2HTML_TEMPERATURE")]
    temperature: Option<f32>,

    /// Concurrent uploads.
    #[arg(long, env = "PDF2HTML_UPLOAD_WORKERS", default_value_t = 10)]
    upload_workers: usize,

    /// Concurrent generation calls.
    #[arg(long, env = "PDF2HTML_GENERATION_WORKERS", default_value_t = 5)]
    generation_workers: usize,

    /// Extra rounds for pages that failed a phase.
    #[arg(long, env = "PDF2HTML_PHASE_RETRIES", default_value_t = 1)]
    phase_retries: u32,

    /// Retries per remote call on transient errors.
    #[arg(long, env = "PDF2HTML_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Seconds to wait for an upload to become active.
    #[arg(long, env = "PDF2HTML_PROCESSING_TIMEOUT", default_value_t = 300)]
    processing_timeout: u64,

    /// Path to a text file with a custom page prompt.
    #[arg(long, env = "PDF2HTML_PROMPT")]
    prompt: Option<PathBuf>,

    /// Do not embed page images next to figure descriptions.
    #[arg(long, env = "PDF2HTML_NO_PREVIEWS")]
    no_previews: bool,

    /// Parent directory for transient page images.
    #[arg(long, env = "PDF2HTML_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Print the run summary (PipelineOutput) as JSON on stdout.
    #[arg(long, env = "PDF2HTML_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2HTML_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2HTML_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2HTML_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar prints warnings itself; keep library logs quiet
    // unless asked.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if let Some(ref corrections) = cli.patch {
        return run_patch(&cli, corrections).await;
    }

    // ── Backends ─────────────────────────────────────────────────────────
    // Credential first: nothing else runs without it.
    let client = match cli.api_key.as_deref() {
        Some(key) => GeminiClient::new(key),
        None => GeminiClient::from_env(),
    }
    .context("Gemini client unavailable")?;
    let client = Arc::new(client);
    let rasterizer = DirectoryRasterizer::open(&cli.input)
        .with_context(|| format!("Cannot open {}", cli.input.display()))?;
    let backends = Backends {
        rasterizer: Arc::new(rasterizer),
        store: client.clone(),
        generator: client,
        secret: None,
    };

    let config = build_config(&cli).await?;
    let mut pipeline = Pipeline::new(config, backends);
    if show_progress {
        pipeline = pipeline.with_observer(CliObserver::new(cli.verbose));
    }

    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", dim("Cancelling, cleaning up remote files…"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    match pipeline.run(cancel).await {
        Ok(output) => {
            if cli.json {
                let json = serde_json::to_string_pretty(&output)
                    .context("Failed to serialise output")?;
                println!("{json}");
            } else if !cli.quiet && !show_progress {
                eprintln!(
                    "Wrote {} ({}/{} pages) in {}ms",
                    output.locator.path.display(),
                    output.locator.pages_rendered,
                    output.locator.pages_total,
                    output.stats.total_ms
                );
            }
            if !cli.quiet && !cli.json && !output.cleanup.is_clean() {
                eprintln!(
                    "   {} remote file(s) could not be deleted",
                    output.cleanup.remote_failed
                );
            }
            Ok(())
        }
        Err(e @ PipelineError::Cancelled { .. }) => {
            if !cli.quiet && !show_progress {
                eprintln!("{e}");
            }
            std::process::exit(130);
        }
        Err(e) => Err(e).context("Conversion failed"),
    }
}

/// Merge corrected pages into an earlier output. No credential needed.
async fn run_patch(cli: &Cli, corrections: &Path) -> Result<()> {
    let output = patched_path(&cli.input, &cli.output_dir);
    let outcome = patch_file(&cli.input, corrections, &output)
        .await
        .context("Patch failed")?;
    if cli.json {
        let summary = serde_json::json!({
            "path": output,
            "replaced": outcome.replaced,
            "added": outcome.added,
            "missing": outcome.missing,
        });
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        eprintln!(
            "{} {} replaced, {} added  →  {}",
            green("✔"),
            outcome.replaced.len(),
            outcome.added.len(),
            bold(&output.display().to_string())
        );
        if outcome.is_partial() {
            let pages: Vec<String> = outcome.missing.iter().map(|p| p.to_string()).collect();
            eprintln!("   {} still missing: {}", yellow("⚠"), pages.join(", "));
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let prompt = match cli.prompt {
        Some(ref path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        ),
        None => None,
    };

    let mut builder = PipelineConfig::builder()
        .page_range(cli.pages.clone())
        .upload_workers(cli.upload_workers)
        .generation_workers(cli.generation_workers)
        .phase_retry_limit(cli.phase_retries)
        .max_retries(cli.max_retries)
        .processing_timeout(Duration::from_secs(cli.processing_timeout))
        .output_dir(cli.output_dir.clone())
        .embed_previews(!cli.no_previews);

    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    if let Some(t) = cli.temperature {
        builder = builder.temperature(t);
    }
    if cli.escalation_model.is_some() || cli.escalation_max_tokens.is_some() {
        let defaults = PipelineConfig::default().escalation_profile;
        let mut profile = GenerationProfile::new(
            cli.escalation_model.clone().unwrap_or(defaults.model),
        );
        if let Some(n) = cli.escalation_max_tokens.or(defaults.max_output_tokens) {
            profile = profile.with_max_output_tokens(n);
        }
        builder = builder.escalation_profile(profile);
    }
    if let Some(ref s) = cli.stem {
        builder = builder.output_stem(s.clone());
    }
    if let Some(ref t) = cli.title {
        builder = builder.title(t.clone());
    }
    if let Some(ref d) = cli.work_dir {
        builder = builder.work_dir_root(d.clone());
    }
    if let Some(p) = prompt {
        builder = builder.prompt_template(p);
    }

    builder.build().context("Invalid configuration")
}
