//! Generation phase: turn each uploaded page into markup under bounded
//! concurrency and place the results by order index.
//!
//! Workers finish in any order. Each result is written to
//! `buffer[order_index]`, where the index is the one the coordinator tracked
//! when it scheduled the task. The index echoed back by the worker is only
//! compared, never used.
//!
//! Rounds work as in the upload phase. A page whose response was truncated
//! at the token limit is requeued with the escalation profile; any other
//! failure is retried unchanged.

use super::extract::extract_content;
use super::pool::WorkerPool;
use super::postprocess::clean_html;
use super::retry::call_with_retry;
use super::upload::file_label;
use crate::cancel::CancelToken;
use crate::config::{GenerationProfile, PipelineConfig, RetryPolicy};
use crate::error::{FailureReason, PipelineError, RemoteError};
use crate::progress::Reporter;
use crate::prompts::{render_page_prompt, DEFAULT_PAGE_PROMPT};
use crate::remote::{FinishReason, GenerationRequest, GenerationService};
use crate::task::{GenerationResult, GenerationTask, ItemState, PageContent, Phase, ResultBuffer};
use base64::Engine;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of the generation phase. Successful pages are in the buffer.
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    /// Last failure of every page that never succeeded, by order index.
    pub failures: BTreeMap<usize, FailureReason>,
    pub rounds: u32,
    /// Pages that were retried with the escalation profile.
    pub escalated: usize,
}

struct Attempt {
    result: GenerationResult,
    model: String,
    quota: Option<String>,
}

struct Tracked {
    task: GenerationTask,
    state: ItemState,
    last_failure: Option<FailureReason>,
}

/// Drives the generation phase.
pub struct GenerationCoordinator {
    service: Arc<dyn GenerationService>,
    pool: WorkerPool,
    call_retry: RetryPolicy,
    phase_retry_limit: u32,
    escalation_profile: GenerationProfile,
    prompt_template: String,
    reporter: Reporter,
    cancel: CancelToken,
}

impl GenerationCoordinator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        config: &PipelineConfig,
        reporter: Reporter,
        cancel: CancelToken,
    ) -> Self {
        Self {
            service,
            pool: WorkerPool::new("generation", config.generation_workers),
            call_retry: config.call_retry,
            phase_retry_limit: config.phase_retry_limit,
            escalation_profile: config.escalation_profile.clone(),
            prompt_template: config
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_PAGE_PROMPT.to_string()),
            reporter,
            cancel,
        }
    }

    /// Generate every task, filling `buffer` as pages succeed.
    ///
    /// Fails only on cancellation, quota exhaustion, or when no page produced
    /// content after every round.
    pub async fn generate(
        &self,
        tasks: Vec<GenerationTask>,
        buffer: &ResultBuffer,
    ) -> Result<GenerationReport, PipelineError> {
        let attempted = tasks.len();
        let mut tracked: Vec<Tracked> = tasks
            .into_iter()
            .map(|task| Tracked {
                task,
                state: ItemState::Pending,
                last_failure: None,
            })
            .collect();
        let mut pending: Vec<usize> = (0..tracked.len()).collect();
        let mut escalated: BTreeSet<usize> = BTreeSet::new();
        let mut rounds = 0u32;

        for round in 0..=self.phase_retry_limit {
            if pending.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    phase: Phase::Generation,
                });
            }
            rounds += 1;

            for &i in &pending {
                let t = &mut tracked[i];
                if t.state == ItemState::Failed {
                    t.state = ItemState::Pending;
                    if t.last_failure.as_ref().is_some_and(FailureReason::is_truncation) {
                        t.task.profile = self.escalation_profile.clone();
                        escalated.insert(t.task.order_index);
                        self.reporter.info(format!(
                            "Page {}: escalating to {} after truncated output",
                            t.task.page_number, t.task.profile.model
                        ));
                    }
                }
                t.state = ItemState::InFlight;
            }

            let label = if round == 0 {
                "Generating".to_string()
            } else {
                format!("Generating (retry round {round})")
            };
            self.reporter.info(format!(
                "{label}: {} page(s) with {} worker(s)...",
                pending.len(),
                self.pool.size()
            ));

            let items: Vec<(usize, usize, GenerationTask)> = pending
                .iter()
                .map(|&i| (i, tracked[i].task.order_index, tracked[i].task.clone()))
                .collect();
            let outcomes = self
                .pool
                .run_round(
                    items,
                    |(slot, order_index, task)| async move {
                        (slot, order_index, self.generate_one(task).await)
                    },
                    |_, done, total| self.reporter.progress(done, total, label.as_str()),
                )
                .await;

            let mut quota: Option<String> = None;
            for (slot, tracked_index, attempt) in outcomes {
                let t = &mut tracked[slot];
                if let Some(d) = attempt.quota {
                    quota.get_or_insert(d);
                }
                let placed = place_result(
                    buffer,
                    tracked_index,
                    attempt.result.clone(),
                    &attempt.model,
                    &self.reporter,
                );
                if placed {
                    t.state = ItemState::Active;
                    t.last_failure = None;
                } else {
                    let reason = attempt
                        .result
                        .failure
                        .unwrap_or_else(|| FailureReason::ExtractionFailed("empty".into()));
                    t.state = if reason == FailureReason::Cancelled {
                        ItemState::Cancelled
                    } else {
                        ItemState::Failed
                    };
                    self.reporter
                        .warn(format!("Page {}: {reason}", t.task.page_number));
                    t.last_failure = Some(reason);
                }
            }

            if let Some(detail) = quota {
                self.reporter.error(format!("Quota exhausted during generation: {detail}"));
                return Err(PipelineError::QuotaExhausted { detail });
            }
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    phase: Phase::Generation,
                });
            }

            pending = (0..tracked.len())
                .filter(|&i| tracked[i].state == ItemState::Failed)
                .collect();
            self.reporter.info(format!(
                "Generation round {} finished: {} page(s) done, {} failed.",
                round + 1,
                buffer.populated(),
                pending.len()
            ));
        }

        let failures: BTreeMap<usize, FailureReason> = tracked
            .iter()
            .filter(|t| t.state != ItemState::Active)
            .filter_map(|t| t.last_failure.clone().map(|f| (t.task.order_index, f)))
            .collect();

        if buffer.populated() == 0 && attempted > 0 {
            let first_error = failures
                .values()
                .next()
                .map(|f| f.to_string())
                .unwrap_or_default();
            return Err(PipelineError::AllPagesFailed {
                attempted,
                rounds,
                first_error,
            });
        }

        Ok(GenerationReport {
            failures,
            rounds,
            escalated: escalated.len(),
        })
    }

    async fn generate_one(&self, task: GenerationTask) -> Attempt {
        let model = task.profile.model.clone();
        let file_name = file_label(&task.artifact);
        let (dimensions, preview) = read_side_channel(task.artifact.clone()).await;

        let request = GenerationRequest {
            profile: task.profile.clone(),
            prompt: render_page_prompt(&self.prompt_template, task.page_number, &file_name, dimensions),
            file: task.handle.clone(),
        };

        let response = call_with_retry(
            &self.call_retry,
            &self.cancel,
            &self.reporter,
            &format!("Generate page {}", task.page_number),
            || self.service.generate(&request),
        )
        .await;

        let failed = |reason: FailureReason, quota: Option<String>| Attempt {
            result: GenerationResult::failed(&task, reason),
            model: model.clone(),
            quota,
        };

        let response = match response {
            Ok(r) => r,
            Err(RemoteError::QuotaExhausted(d)) => {
                return failed(FailureReason::Remote(format!("quota exhausted: {d}")), Some(d))
            }
            Err(e) => return failed(e.into(), None),
        };

        if response.finish_reason == FinishReason::MaxTokens {
            debug!("Page {}: truncated with {}", task.page_number, model);
            return failed(FailureReason::Truncated, None);
        }

        let content = extract_content(&response.text)
            .map(|raw| clean_html(&raw))
            .filter(|c| !c.is_empty());
        match content {
            Some(body) => Attempt {
                result: GenerationResult {
                    order_index: task.order_index,
                    page_number: task.page_number,
                    content: Some(body),
                    auxiliary_preview: preview,
                    failure: None,
                },
                model: model.clone(),
                quota: None,
            },
            None => failed(
                FailureReason::ExtractionFailed(response.finish_reason.label().to_string()),
                None,
            ),
        }
    }
}

/// Write a worker result into the buffer at the coordinator-tracked index.
///
/// Returns `true` when the result carried content and its slot was filled.
pub(crate) fn place_result(
    buffer: &ResultBuffer,
    tracked_index: usize,
    result: GenerationResult,
    model: &str,
    reporter: &Reporter,
) -> bool {
    if result.order_index != tracked_index {
        reporter.warn(format!(
            "Page {}: worker reported index {} but task was scheduled at {}; using {}",
            result.page_number, result.order_index, tracked_index, tracked_index
        ));
    }
    let Some(body) = result.content else {
        return false;
    };
    let page_number = buffer.page_number(tracked_index).unwrap_or(result.page_number);
    let content = PageContent {
        page_number,
        body,
        preview: result.auxiliary_preview,
        model: model.to_string(),
    };
    match buffer.fill(tracked_index, content) {
        Ok(()) => true,
        Err(e) => {
            warn!("Page {page_number}: result not stored: {e}");
            false
        }
    }
}

/// Image dimensions and base64 preview of a page artifact.
///
/// Both are optional extras: a failure here only drops them from the request.
async fn read_side_channel(path: PathBuf) -> (Option<(u32, u32)>, Option<String>) {
    tokio::task::spawn_blocking(move || read_side_channel_blocking(&path))
        .await
        .unwrap_or((None, None))
}

fn read_side_channel_blocking(path: &Path) -> (Option<(u32, u32)>, Option<String>) {
    let dimensions = image::image_dimensions(path)
        .map_err(|e| debug!("{}: no dimensions: {e}", path.display()))
        .ok();
    let preview = std::fs::read(path)
        .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
        .map_err(|e| debug!("{}: no preview: {e}", path.display()))
        .ok();
    (dimensions, preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteHandle;

    fn result(order_index: usize, page: usize, content: Option<&str>) -> GenerationResult {
        GenerationResult {
            order_index,
            page_number: page,
            content: content.map(str::to_string),
            auxiliary_preview: None,
            failure: content.is_none().then_some(FailureReason::Truncated),
        }
    }

    #[test]
    fn mismatched_echo_uses_tracked_index() {
        let buffer = ResultBuffer::new([1, 2, 3]);
        let reporter = Reporter::default();
        assert!(place_result(&buffer, 2, result(0, 3, Some("<p>3</p>")), "m", &reporter));
        assert!(buffer.get(0).is_none());
        assert_eq!(buffer.get(2).map(|c| c.body.as_str()), Some("<p>3</p>"));
        assert!(reporter
            .snapshot()
            .iter()
            .any(|l| l.message.contains("using 2")));
    }

    #[test]
    fn failures_leave_slot_empty() {
        let buffer = ResultBuffer::new([1]);
        assert!(!place_result(&buffer, 0, result(0, 1, None), "m", &Reporter::default()));
        assert_eq!(buffer.populated(), 0);
    }

    #[test]
    fn second_write_is_refused() {
        let buffer = ResultBuffer::new([1]);
        let r = Reporter::default();
        assert!(place_result(&buffer, 0, result(0, 1, Some("<p>a</p>")), "m", &r));
        assert!(!place_result(&buffer, 0, result(0, 1, Some("<p>b</p>")), "m", &r));
        assert_eq!(buffer.get(0).map(|c| c.body.as_str()), Some("<p>a</p>"));
    }

    #[tokio::test]
    async fn side_channel_reads_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page_00001.png");
        image::RgbaImage::new(3, 5).save(&path).unwrap();
        let (dims, preview) = read_side_channel(path).await;
        assert_eq!(dims, Some((3, 5)));
        assert!(preview.is_some_and(|p| !p.is_empty()));

        let (dims, preview) = read_side_channel(dir.path().join("missing.png")).await;
        assert!(dims.is_none() && preview.is_none());
    }

    #[test]
    fn failed_result_keeps_task_identity() {
        let task = GenerationTask {
            order_index: 4,
            page_number: 9,
            handle: RemoteHandle {
                name: "files/x".into(),
                uri: "u".into(),
                mime_type: "image/png".into(),
            },
            artifact: PathBuf::from("page_00009.png"),
            profile: GenerationProfile::default(),
        };
        let r = GenerationResult::failed(&task, FailureReason::Truncated);
        assert_eq!((r.order_index, r.page_number), (4, 9));
        assert!(r.content.is_none());
    }
}
