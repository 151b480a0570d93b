//! Upload phase: push page artifacts to the remote store under bounded
//! concurrency and wait for each to become active.
//!
//! ## Rounds
//!
//! Round 0 submits every artifact to the pool. Each later round (up to
//! `phase_retry_limit`) resubmits only the items that failed in the round
//! before. A round is a barrier: the next one starts only after every item
//! of the current one has finished.
//!
//! ## Per item
//!
//! ```text
//! content type ──▶ upload (call retry) ──▶ register handle ──▶ poll until ACTIVE
//!      │ unknown          │ quota ⇒ fatal after round          │ timeout / FAILED ⇒ delete, item failed
//!      ▼                  ▼                                     │ cancel ⇒ delete, item cancelled
//!   failed, no call    failed                                   ▼
//! ```
//!
//! A handle is registered the moment the upload call returns, before any
//! polling, so cleanup sees it on every exit path.

use super::pool::WorkerPool;
use super::retry::call_with_retry;
use crate::cancel::CancelToken;
use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::{FailureReason, PipelineError, RemoteError};
use crate::progress::Reporter;
use crate::remote::{HandleRegistry, RemoteFileState, RemoteHandle, RemoteStore};
use crate::task::{ItemState, Phase, UploadRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of the whole upload phase.
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Artifacts that ended ACTIVE, keyed by local path.
    pub handles: HashMap<PathBuf, RemoteHandle>,
    /// Final record for every attempted artifact, in input order.
    pub records: Vec<UploadRecord>,
    pub rounds: u32,
}

impl UploadReport {
    pub fn survivors(&self) -> usize {
        self.handles.len()
    }

    /// Items that did not end ACTIVE.
    pub fn permanent_failures(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state != ItemState::Active)
            .count()
    }
}

enum ItemOutcome {
    Active(RemoteHandle),
    Failed(FailureReason),
    Cancelled,
    QuotaExhausted(String),
}

/// Drives the upload phase.
pub struct UploadCoordinator {
    store: Arc<dyn RemoteStore>,
    registry: Arc<HandleRegistry>,
    pool: WorkerPool,
    call_retry: RetryPolicy,
    processing_timeout: Duration,
    poll_interval: Duration,
    phase_retry_limit: u32,
    document_name: String,
    reporter: Reporter,
    cancel: CancelToken,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        registry: Arc<HandleRegistry>,
        config: &PipelineConfig,
        document_name: impl Into<String>,
        reporter: Reporter,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            registry,
            pool: WorkerPool::new("upload", config.upload_workers),
            call_retry: config.call_retry,
            processing_timeout: config.processing_timeout,
            poll_interval: config.poll_interval,
            phase_retry_limit: config.phase_retry_limit,
            document_name: document_name.into(),
            reporter,
            cancel,
        }
    }

    /// Upload `artifacts` and return the handles of those that became active.
    ///
    /// Fails only on cancellation, quota exhaustion, or when no artifact
    /// survived every round.
    pub async fn upload(&self, artifacts: &[PathBuf]) -> Result<UploadReport, PipelineError> {
        let mut records: Vec<UploadRecord> =
            artifacts.iter().cloned().map(UploadRecord::new).collect();
        let mut pending: Vec<usize> = (0..records.len()).collect();
        let mut rounds = 0u32;

        for round in 0..=self.phase_retry_limit {
            if pending.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                mark_cancelled(&mut records, &pending);
                return Err(PipelineError::Cancelled {
                    phase: Phase::Upload,
                });
            }
            rounds += 1;

            for &i in &pending {
                let r = &mut records[i];
                if r.state == ItemState::Failed {
                    r.advance(ItemState::Pending);
                }
                r.advance(ItemState::InFlight);
                r.attempts += 1;
            }

            let label = if round == 0 {
                "Uploading".to_string()
            } else {
                format!("Uploading (retry round {round})")
            };
            self.reporter.info(format!(
                "{label}: {} file(s) with {} worker(s)...",
                pending.len(),
                self.pool.size()
            ));

            let items: Vec<(usize, PathBuf)> = pending
                .iter()
                .map(|&i| (i, records[i].artifact.clone()))
                .collect();
            let outcomes = self
                .pool
                .run_round(
                    items,
                    |(i, path)| async move { (i, self.upload_one(&path).await) },
                    |_, done, total| self.reporter.progress(done, total, label.as_str()),
                )
                .await;

            let mut quota: Option<String> = None;
            for (i, outcome) in outcomes {
                let r = &mut records[i];
                match outcome {
                    ItemOutcome::Active(handle) => {
                        r.advance(ItemState::Active);
                        r.handle = Some(handle);
                        r.last_failure = None;
                    }
                    ItemOutcome::Failed(reason) => {
                        r.advance(ItemState::Failed);
                        r.last_failure = Some(reason);
                    }
                    ItemOutcome::Cancelled => {
                        r.advance(ItemState::Cancelled);
                        r.last_failure = Some(FailureReason::Cancelled);
                    }
                    ItemOutcome::QuotaExhausted(detail) => {
                        r.advance(ItemState::Failed);
                        r.last_failure = Some(FailureReason::Remote(detail.clone()));
                        quota.get_or_insert(detail);
                    }
                }
            }

            if let Some(detail) = quota {
                self.reporter.error(format!("Quota exhausted during upload: {detail}"));
                return Err(PipelineError::QuotaExhausted { detail });
            }

            pending = (0..records.len())
                .filter(|&i| records[i].state == ItemState::Failed)
                .collect();

            if self.cancel.is_cancelled() {
                mark_cancelled(&mut records, &pending);
                return Err(PipelineError::Cancelled {
                    phase: Phase::Upload,
                });
            }

            let active = records.iter().filter(|r| r.state == ItemState::Active).count();
            self.reporter.info(format!(
                "Upload round {} finished: {active} active, {} failed.",
                round + 1,
                pending.len()
            ));
        }

        let handles: HashMap<PathBuf, RemoteHandle> = records
            .iter()
            .filter(|r| r.state == ItemState::Active)
            .filter_map(|r| r.handle.clone().map(|h| (r.artifact.clone(), h)))
            .collect();

        for r in records.iter().filter(|r| r.state != ItemState::Active) {
            let reason = r
                .last_failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".into());
            self.reporter
                .warn(format!("Upload of {} failed permanently: {reason}", file_label(&r.artifact)));
        }

        if handles.is_empty() && !records.is_empty() {
            let first_error = records
                .iter()
                .find_map(|r| r.last_failure.as_ref().map(|f| f.to_string()))
                .unwrap_or_default();
            return Err(PipelineError::AllUploadsFailed {
                attempted: records.len(),
                rounds,
                first_error,
            });
        }

        self.reporter.info(format!(
            "Upload finished: {} of {} file(s) active.",
            handles.len(),
            records.len()
        ));
        Ok(UploadReport {
            handles,
            records,
            rounds,
        })
    }

    async fn upload_one(&self, path: &Path) -> ItemOutcome {
        let file_name = file_label(path);
        let Some(mime) = mime_guess::from_path(path).first() else {
            self.reporter
                .warn(format!("{file_name}: content type could not be determined, skipping"));
            return ItemOutcome::Failed(FailureReason::UnknownContentType);
        };
        let mime = mime.essence_str().to_string();
        let display_name = format!("{} - {file_name}", self.document_name);
        let started = Instant::now();

        let uploaded = call_with_retry(
            &self.call_retry,
            &self.cancel,
            &self.reporter,
            &format!("Upload {file_name}"),
            || self.store.upload(path, &display_name, &mime),
        )
        .await;

        let mut file = match uploaded {
            Ok(f) => f,
            Err(RemoteError::Cancelled) => return ItemOutcome::Cancelled,
            Err(RemoteError::QuotaExhausted(d)) => return ItemOutcome::QuotaExhausted(d),
            Err(e) => {
                warn!("{file_name}: upload failed: {e}");
                return ItemOutcome::Failed(e.into());
            }
        };
        self.registry.register(file.handle.clone());
        debug!("{file_name}: uploaded as {}", file.handle.name);

        loop {
            match &file.state {
                RemoteFileState::Active => return ItemOutcome::Active(file.handle),
                RemoteFileState::Processing => {}
                other => {
                    let state = other.label().to_string();
                    self.reporter
                        .warn(format!("{file_name}: remote processing ended in state {state}"));
                    self.discard(&file.handle).await;
                    return ItemOutcome::Failed(FailureReason::NotActive(state));
                }
            }

            if self.cancel.is_cancelled() {
                self.discard(&file.handle).await;
                return ItemOutcome::Cancelled;
            }
            if started.elapsed() >= self.processing_timeout {
                self.reporter.warn(format!(
                    "{file_name}: still processing after {}s, giving up",
                    self.processing_timeout.as_secs()
                ));
                self.discard(&file.handle).await;
                return ItemOutcome::Failed(FailureReason::ProcessingTimeout(
                    self.processing_timeout.as_secs(),
                ));
            }
            if !self.cancel.sleep(self.poll_interval).await {
                self.discard(&file.handle).await;
                return ItemOutcome::Cancelled;
            }

            let handle = file.handle.clone();
            match call_with_retry(
                &self.call_retry,
                &self.cancel,
                &self.reporter,
                &format!("Status of {file_name}"),
                || self.store.status(&handle),
            )
            .await
            {
                Ok(f) => file = f,
                Err(RemoteError::Cancelled) => {
                    self.discard(&handle).await;
                    return ItemOutcome::Cancelled;
                }
                Err(RemoteError::QuotaExhausted(d)) => return ItemOutcome::QuotaExhausted(d),
                Err(e) => {
                    self.discard(&handle).await;
                    return ItemOutcome::Failed(e.into());
                }
            }
        }
    }

    /// Best-effort deletion of an item's own remote object.
    ///
    /// On success the handle leaves the registry so cleanup does not delete
    /// it a second time; on failure it stays for cleanup to retry.
    async fn discard(&self, handle: &RemoteHandle) {
        match self.store.delete(handle).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {
                self.registry.remove(&handle.name);
            }
            Err(e) => {
                warn!("Could not delete {} now, leaving it for cleanup: {e}", handle.name);
            }
        }
    }
}

fn mark_cancelled(records: &mut [UploadRecord], indices: &[usize]) {
    for &i in indices {
        let r = &mut records[i];
        if r.state == ItemState::Failed {
            r.advance(ItemState::Pending);
        }
        r.advance(ItemState::Cancelled);
    }
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
