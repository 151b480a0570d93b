//! Result types returned by a successful run.

use crate::progress::StatusLine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the assembled artifact was written and how complete it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocator {
    pub path: PathBuf,
    /// `true` when fewer pages were rendered than were selected.
    pub partial: bool,
    pub pages_rendered: usize,
    pub pages_total: usize,
}

/// Everything a caller gets back from [`crate::convert::Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub run_id: String,
    pub locator: ArtifactLocator,
    pub stats: RunStats,
    pub cleanup: CleanupReport,
    /// Every status line emitted during the run, in emission order.
    pub status_log: Vec<StatusLine>,
}

/// Counters and timings for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Pages in the source document.
    pub source_pages: usize,
    /// Pages chosen by the page range.
    pub selected_pages: usize,
    pub rasterized_pages: usize,
    pub uploaded_pages: usize,
    pub generated_pages: usize,
    /// Pages that needed the escalation profile.
    pub escalated_pages: usize,
    pub upload_rounds: u32,
    pub generation_rounds: u32,
    pub rasterize_ms: u64,
    pub upload_ms: u64,
    pub generation_ms: u64,
    pub assembly_ms: u64,
    pub total_ms: u64,
}

/// What the cleanup phase managed to release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub local_removed: usize,
    pub local_failed: usize,
    pub work_dir_removed: bool,
    pub remote_deleted: usize,
    /// Handles that were already gone on the remote side.
    pub remote_missing: usize,
    pub remote_failed: usize,
}

impl CleanupReport {
    /// No local or remote release failed.
    pub fn is_clean(&self) -> bool {
        self.local_failed == 0 && self.remote_failed == 0
    }
}
