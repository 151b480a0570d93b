//! Cleanup: best-effort release of every transient resource of a run.
//!
//! Runs on every exit path. Local artifacts go first, then their directory,
//! then every remote handle still in the registry. No failure here raises;
//! each one is logged and counted in the [`CleanupReport`].

use crate::error::RemoteError;
use crate::output::CleanupReport;
use crate::progress::Reporter;
use crate::remote::{HandleRegistry, RemoteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

/// Everything cleanup needs, taken out of the run.
pub struct CleanupJob {
    pub local_artifacts: Vec<PathBuf>,
    pub work_dir: Option<TempDir>,
    pub registry: Arc<HandleRegistry>,
    pub store: Arc<dyn RemoteStore>,
    /// Pause between remote deletions, to stay under rate limits.
    pub delete_spacing: Duration,
}

/// Release local files, the work directory, then remote handles.
///
/// Deliberately not cancellable: cleanup must finish even for a cancelled run.
pub async fn cleanup(job: CleanupJob, reporter: &Reporter) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in &job.local_artifacts {
        match tokio::fs::remove_file(path).await {
            Ok(()) => report.local_removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                report.local_failed += 1;
                reporter.warn(format!("Could not remove {}: {e}", path.display()));
            }
        }
    }

    if let Some(dir) = job.work_dir {
        let shown = dir.path().display().to_string();
        match dir.close() {
            Ok(()) => {
                report.work_dir_removed = true;
                debug!("Removed work directory {shown}");
            }
            Err(e) => reporter.warn(format!("Could not remove work directory {shown}: {e}")),
        }
    }

    let handles = job.registry.drain();
    if !handles.is_empty() {
        reporter.info(format!("Deleting {} remote file(s)...", handles.len()));
    }
    let total = handles.len();
    for (i, handle) in handles.iter().enumerate() {
        if i > 0 && !job.delete_spacing.is_zero() {
            tokio::time::sleep(job.delete_spacing).await;
        }
        match job.store.delete(handle).await {
            Ok(()) => report.remote_deleted += 1,
            Err(RemoteError::NotFound(_)) => report.remote_missing += 1,
            Err(e) => {
                report.remote_failed += 1;
                reporter.warn(format!("Could not delete remote file {}: {e}", handle.name));
            }
        }
        reporter.progress(i + 1, total, "Cleaning up");
    }

    reporter.info(format!(
        "Cleanup finished: {} local file(s) removed, {} remote file(s) deleted.",
        report.local_removed, report.remote_deleted
    ));
    report
}
