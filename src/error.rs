//! Error types for the edgequake-pdf2html library.
//!
//! Three distinct error types reflect three distinct failure scopes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot produce an artifact at all
//!   (bad page range, missing credential, every page failed, quota gone,
//!   cancellation). Returned as `Err(PipelineError)` from
//!   [`crate::convert::Pipeline::run`] and [`crate::convert::convert`].
//!
//! * [`RemoteError`] — **Call-level**: one request to the remote store or the
//!   generation service failed. Only [`RemoteError::Transient`] is retried by
//!   the call-level backoff loop; quota exhaustion is never retried.
//!
//! * [`FailureReason`] — **Item-level**: a single page failed a phase. Stored
//!   on the upload record or generation result so the owning coordinator can
//!   requeue it in the next round instead of aborting the whole document.
//!
//! Item failures never raise out of a worker. A phase raises only when it
//! ends with zero survivors.

use crate::task::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2html library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// A credential the remote backend needs is not set.
    #[error("Credential '{var}' is not set.\nExport it before running, e.g. export {var}=...")]
    MissingCredential { var: String },

    /// The page-range string is malformed, reversed, out of bounds, or
    /// resolves to no pages at all.
    #[error("Invalid page range '{input}': {reason}\nExpected a format like 1-3,5,7-")]
    InvalidPageRange { input: String, reason: String },

    /// The source document has no pages.
    #[error("Source document has no pages")]
    EmptyDocument,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Source errors ─────────────────────────────────────────────────────
    /// The source document (or page directory) does not exist.
    #[error("Source not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// The source is protected and the secret callback supplied no key.
    #[error("Source '{document}' is protected and no secret was supplied.\nProvide a secret callback that returns its password.")]
    SecretRequired { document: String },

    /// The source exists but could not be read.
    #[error("Source '{path}' could not be read: {detail}")]
    SourceUnreadable { path: PathBuf, detail: String },

    /// No selected page could be rasterised.
    #[error("Rasterisation failed for all {attempted} selected pages.\nFirst error: {first_error}")]
    RasterisationFailed {
        attempted: usize,
        first_error: String,
    },

    // ── Run-terminating remote outcomes ───────────────────────────────────
    /// Cooperative cancellation was requested. Not a failure of the system,
    /// but it still terminates the run (after cleanup).
    #[error("Run cancelled during {phase} phase")]
    Cancelled { phase: Phase },

    /// The remote quota is exhausted. Never retried; surfaced verbatim.
    #[error("Remote quota exhausted: {detail}\nCheck your plan limits before retrying.")]
    QuotaExhausted { detail: String },

    /// Every artifact failed to upload after all rounds.
    #[error("All {attempted} uploads failed after {rounds} round(s).\nFirst error: {first_error}")]
    AllUploadsFailed {
        attempted: usize,
        rounds: u32,
        first_error: String,
    },

    /// Every page failed generation after all rounds; nothing to assemble.
    #[error("All {attempted} pages failed after {rounds} round(s).\nFirst error: {first_error}")]
    AllPagesFailed {
        attempted: usize,
        rounds: u32,
        first_error: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the assembled output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create the transient work directory.
    #[error("Failed to create work directory: {0}")]
    WorkDir(#[source] std::io::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (a panicked phase, a lost blocking task).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`PipelineError`].
///
/// Front ends use this to pick a message style (cancellation is not shown
/// as an error) without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Cancellation,
    QuotaExhausted,
    Phase,
    Io,
    Internal,
}

impl PipelineError {
    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingCredential { .. }
            | PipelineError::InvalidPageRange { .. }
            | PipelineError::EmptyDocument
            | PipelineError::InvalidConfig(_)
            | PipelineError::SourceNotFound { .. }
            | PipelineError::SourceUnreadable { .. }
            | PipelineError::SecretRequired { .. } => ErrorKind::Configuration,
            PipelineError::Cancelled { .. } => ErrorKind::Cancellation,
            PipelineError::QuotaExhausted { .. } => ErrorKind::QuotaExhausted,
            PipelineError::RasterisationFailed { .. }
            | PipelineError::AllUploadsFailed { .. }
            | PipelineError::AllPagesFailed { .. } => ErrorKind::Phase,
            PipelineError::OutputWriteFailed { .. } | PipelineError::WorkDir(_) => ErrorKind::Io,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` when the run ended because cancellation was requested.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}

/// Which class of transient remote failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    RateLimited,
    Timeout,
    Unavailable,
    Internal,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::RateLimited => "rate limited",
            TransientKind::Timeout => "timeout",
            TransientKind::Unavailable => "unavailable",
            TransientKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A single failed call to the remote store or the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Quota or resource exhaustion. Fatal; never retried.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Rate limit, timeout, unavailable or internal server error.
    #[error("transient remote error ({kind}): {detail}")]
    Transient { kind: TransientKind, detail: String },

    /// The request was rejected and retrying it unchanged will not help.
    #[error("remote rejected request (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The addressed remote object does not exist (already deleted).
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// The call observed cancellation before or while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// A local failure while preparing the call (reading the artifact).
    #[error("local error: {0}")]
    Local(String),
}

impl RemoteError {
    /// Shorthand for a transient error.
    pub fn transient(kind: TransientKind, detail: impl Into<String>) -> Self {
        RemoteError::Transient {
            kind,
            detail: detail.into(),
        }
    }

    /// Whether the call-level retry loop may try this call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, RemoteError::QuotaExhausted(_))
    }
}

/// Why a single upload or generation item did not succeed in a round.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No content type could be derived from the artifact path.
    #[error("content type could not be determined")]
    UnknownContentType,

    /// The service stopped at its output-length limit.
    #[error("output truncated at the token limit")]
    Truncated,

    /// The response carried no usable content block.
    #[error("no content block in response (finish reason: {0})")]
    ExtractionFailed(String),

    /// Remote processing ended in a state other than active.
    #[error("remote processing ended in state {0}")]
    NotActive(String),

    /// Remote processing did not finish within the wall-clock timeout.
    #[error("remote processing timed out after {0}s")]
    ProcessingTimeout(u64),

    /// The remote call failed after call-level retries.
    #[error("{0}")]
    Remote(String),

    /// Cancellation was observed while the item was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    /// Truncation failures are requeued with an escalated profile.
    pub fn is_truncation(&self) -> bool {
        matches!(self, FailureReason::Truncated)
    }
}

impl From<RemoteError> for FailureReason {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Remote(other.to_string()),
        }
    }
}
