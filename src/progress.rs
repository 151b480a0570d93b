//! Observer trait and status reporting for pipeline runs.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::convert::Pipeline::with_observer`] to receive three kinds of
//! events: timestamped status lines, phase progress, and exactly one
//! completion signal per run.
//!
//! # Why an observer instead of three closures?
//!
//! A front end usually wants all three sinks and wants them to share state
//! (a progress bar, a log pane, a result dialog). One trait object keeps them
//! together and lets callers forward events to a channel, a WebSocket, or a
//! terminal without the library knowing how the host communicates. See
//! [`crate::stream`] for a ready-made channel adapter.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2html::{PipelineObserver, Progress};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineObserver for Counter {
//!     fn on_progress(&self, p: &Progress) {
//!         self.0.store(p.completed, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::error::ErrorKind;
use crate::output::ArtifactLocator;
use crate::task::Phase;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives pipeline events.
///
/// All methods have default no-op implementations. Calls may arrive from
/// several worker tasks at once, so implementations must be `Send + Sync`
/// and must not block: reporting is never on the correctness path.
pub trait PipelineObserver: Send + Sync {
    /// A human-readable status line was emitted.
    fn on_status(&self, line: &StatusLine) {
        let _ = line;
    }

    /// An item of the current phase finished.
    fn on_progress(&self, progress: &Progress) {
        let _ = progress;
    }

    /// The run ended. Called exactly once, after cleanup.
    fn on_complete(&self, completion: &Completion, status_log: &[StatusLine]) {
        let _ = (completion, status_log);
    }
}

/// Observer that ignores every event. Used when none is configured.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Severity of a [`StatusLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// One timestamped status message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLine {
    pub at: DateTime<Local>,
    pub phase: Phase,
    pub level: StatusLevel,
    pub message: String,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.message
        )
    }
}

/// Progress within the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
    /// Short label for the front end, e.g. "Uploading (round 2)".
    pub label: String,
}

impl Progress {
    /// Progress across the whole run, 0–100, using per-phase weights.
    pub fn overall_percent(&self) -> u8 {
        let (start, end) = self.phase.progress_span();
        if self.total == 0 {
            return start;
        }
        let done = self.completed.min(self.total);
        let span = (end - start) as usize;
        start + (span * done / self.total) as u8
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Completion {
    Complete { locator: ArtifactLocator },
    Partial { locator: ArtifactLocator },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Complete { .. } | Completion::Partial { .. })
    }
}

/// Status sink shared by every phase of one run.
///
/// Each line is stamped with local time, retained in the run log, mirrored to
/// `tracing` and forwarded to the observer. Cheap to clone.
#[derive(Clone)]
pub struct Reporter {
    observer: Arc<dyn PipelineObserver>,
    log: Arc<Mutex<Vec<StatusLine>>>,
    phase: Arc<AtomicU8>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("phase", &self.phase())
            .field("lines", &self.lock_log().len())
            .finish()
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}

impl Reporter {
    pub fn new(observer: Arc<dyn PipelineObserver>) -> Self {
        Self {
            observer,
            log: Arc::new(Mutex::new(Vec::new())),
            phase: Arc::new(AtomicU8::new(Phase::Rasterization.as_u8())),
        }
    }

    pub fn enter(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(StatusLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StatusLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(StatusLevel::Error, message.into());
    }

    pub fn progress(&self, completed: usize, total: usize, label: impl Into<String>) {
        let p = Progress {
            phase: self.phase(),
            completed,
            total,
            label: label.into(),
        };
        self.observer.on_progress(&p);
    }

    pub fn complete(&self, completion: &Completion) {
        let log = self.snapshot();
        self.observer.on_complete(completion, &log);
    }

    /// Copy of every line emitted so far.
    pub fn snapshot(&self) -> Vec<StatusLine> {
        self.lock_log().clone()
    }

    fn emit(&self, level: StatusLevel, message: String) {
        let phase = self.phase();
        match level {
            StatusLevel::Info => tracing::info!(%phase, "{message}"),
            StatusLevel::Warn => tracing::warn!(%phase, "{message}"),
            StatusLevel::Error => tracing::error!(%phase, "{message}"),
        }
        let line = StatusLine {
            at: Local::now(),
            phase,
            level,
            message,
        };
        self.lock_log().push(line.clone());
        self.observer.on_status(&line);
    }

    fn lock_log(&self) -> MutexGuard<'_, Vec<StatusLine>> {
        // A panicking observer must not take the log down with it.
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
