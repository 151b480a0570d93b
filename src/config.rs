//! Configuration types for a document-to-HTML pipeline run.
//!
//! Every knob lives in [`PipelineConfig`], built via [`PipelineConfigBuilder`].
//! Keeping the whole run description in one serialisable struct lets callers
//! log it next to the run id and diff two runs that produced different output.
//!
//! Backends (rasterizer, remote store, generation service) are *not* part of
//! the config; they are injected through [`crate::convert::Backends`].

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Model used for the first generation attempt of every page.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
/// Model used when a page is retried after a truncated response.
pub const DEFAULT_ESCALATION_MODEL: &str = "gemini-2.5-flash";
/// Output allowance of the escalation profile.
pub const DEFAULT_ESCALATION_MAX_TOKENS: u32 = 65_536;

/// Which model to call and with what output allowance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProfile {
    pub model: String,
    /// `None` leaves the service default in place.
    pub max_output_tokens: Option<u32>,
    pub temperature: f32,
}

impl GenerationProfile {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_output_tokens: None,
            temperature: 0.1,
        }
    }

    pub fn with_max_output_tokens(mut self, n: u32) -> Self {
        self.max_output_tokens = Some(n);
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }
}

impl Default for GenerationProfile {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

/// Capped exponential backoff for a single remote call.
///
/// Attempt `n` (0-based) waits `initial_backoff * 2^n`, capped at
/// `max_backoff`, before attempt `n + 1`. Only transient errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Default: 2.
    pub max_retries: u32,
    /// Default: 1 s.
    pub initial_backoff: Duration,
    /// Default: 8 s.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2html::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .page_range("1-3,5")
///     .upload_workers(4)
///     .generation_workers(2)
///     .output_stem("report")
///     .build()
///     .unwrap();
/// assert_eq!(config.upload_workers, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Page-range string, e.g. `"1-3,5,7-"`. Empty selects every page.
    pub page_range: String,

    /// Concurrent uploads. Coerced to ≥ 1. Default: 10.
    pub upload_workers: usize,

    /// Concurrent generation calls. Coerced to ≥ 1. Default: 5.
    ///
    /// Generation calls are far slower and more rate-limited than uploads, so
    /// this pool is smaller by default.
    pub generation_workers: usize,

    /// Profile for the first attempt at every page.
    pub profile: GenerationProfile,

    /// Profile swapped in when a page's response was truncated.
    pub escalation_profile: GenerationProfile,

    /// Extra rounds a phase runs for its failed items. Default: 1.
    pub phase_retry_limit: u32,

    /// Backoff for transient errors inside a single call.
    pub call_retry: RetryPolicy,

    /// Wall-clock limit on remote processing of one upload, measured from
    /// upload start. Default: 300 s.
    pub processing_timeout: Duration,

    /// Delay between processing-status polls. Default: 2 s.
    pub poll_interval: Duration,

    /// Pause between consecutive remote deletions during cleanup. Default: 100 ms.
    pub delete_spacing: Duration,

    /// Directory the final artifact is written to. Default: current directory.
    pub output_dir: PathBuf,

    /// File stem of the artifact. `None` derives it from the source name.
    pub output_stem: Option<String>,

    /// Document title. `None` derives it from the stem.
    pub title: Option<String>,

    /// Parent of the transient work directory. `None` uses the system temp dir.
    pub work_dir_root: Option<PathBuf>,

    /// Per-page instruction template. `None` uses [`crate::prompts::DEFAULT_PAGE_PROMPT`].
    pub prompt_template: Option<String>,

    /// Embed the base64 page image next to pages that describe figures. Default: true.
    pub embed_previews: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_range: String::new(),
            upload_workers: 10,
            generation_workers: 5,
            profile: GenerationProfile::default(),
            escalation_profile: GenerationProfile::new(DEFAULT_ESCALATION_MODEL)
                .with_max_output_tokens(DEFAULT_ESCALATION_MAX_TOKENS),
            phase_retry_limit: 1,
            call_retry: RetryPolicy::default(),
            processing_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            delete_spacing: Duration::from_millis(100),
            output_dir: PathBuf::from("."),
            output_stem: None,
            title: None,
            work_dir_root: None,
            prompt_template: None,
            embed_previews: true,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn page_range(mut self, range: impl Into<String>) -> Self {
        self.config.page_range = range.into();
        self
    }

    pub fn upload_workers(mut self, n: usize) -> Self {
        self.config.upload_workers = n.max(1);
        self
    }

    pub fn generation_workers(mut self, n: usize) -> Self {
        self.config.generation_workers = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.profile.model = model.into();
        self
    }

    pub fn profile(mut self, profile: GenerationProfile) -> Self {
        self.config.profile = profile;
        self
    }

    pub fn escalation_profile(mut self, profile: GenerationProfile) -> Self {
        self.config.escalation_profile = profile;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.profile.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn phase_retry_limit(mut self, n: u32) -> Self {
        self.config.phase_retry_limit = n;
        self
    }

    pub fn call_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.call_retry = policy;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.call_retry.max_retries = n;
        self
    }

    pub fn processing_timeout(mut self, d: Duration) -> Self {
        self.config.processing_timeout = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn delete_spacing(mut self, d: Duration) -> Self {
        self.config.delete_spacing = d;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn output_stem(mut self, stem: impl Into<String>) -> Self {
        self.config.output_stem = Some(stem.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.config.title = Some(title.into());
        self
    }

    pub fn work_dir_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir_root = Some(dir.into());
        self
    }

    pub fn prompt_template(mut self, template: impl Into<String>) -> Self {
        self.config.prompt_template = Some(template.into());
        self
    }

    pub fn embed_previews(mut self, v: bool) -> Self {
        self.config.embed_previews = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.profile.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("model must not be empty".into()));
        }
        if c.escalation_profile.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "escalation model must not be empty".into(),
            ));
        }
        if c.poll_interval.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "poll interval must be greater than zero".into(),
            ));
        }
        if c.call_retry.initial_backoff > c.call_retry.max_backoff {
            return Err(PipelineError::InvalidConfig(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                c.call_retry.initial_backoff, c.call_retry.max_backoff
            )));
        }
        if let Some(stem) = &c.output_stem {
            if stem.is_empty() || stem.contains(['/', '\\']) {
                return Err(PipelineError::InvalidConfig(format!(
                    "output stem '{stem}' must be a bare file name"
                )));
            }
        }
        let mut config = self.config;
        config.upload_workers = config.upload_workers.max(1);
        config.generation_workers = config.generation_workers.max(1);
        Ok(config)
    }
}
