//! End-to-end runs of the pipeline against in-memory remote backends.
//!
//! Page images are real (tiny PNGs in a temp dir) so rasterisation and the
//! preview side channel run for real; the file store and the generation
//! service are fakes that record every call.

use async_trait::async_trait;
use edgequake_pdf2html::error::TransientKind;
use edgequake_pdf2html::pipeline::upload::UploadCoordinator;
use edgequake_pdf2html::remote::{
    FinishReason, GenerationRequest, GenerationResponse, HandleRegistry, RemoteFile,
    RemoteFileState,
};
use edgequake_pdf2html::task::Phase;
use edgequake_pdf2html::stream::{spawn_with_events, PipelineEvent};
use edgequake_pdf2html::{
    Backends, CancelToken, Completion, DirectoryRasterizer, GenerationService, Pipeline,
    PipelineConfig, PipelineError, PipelineObserver, PipelineOutput, RasterError, Rasterizer,
    RemoteError, RemoteHandle, RemoteStore, Reporter, RetryPolicy, SecretCallback, StatusLine,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────────────

fn page_dir(n: usize) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=n {
        image::RgbaImage::from_pixel(8, 12, image::Rgba([255, 255, 255, 255]))
            .save(dir.path().join(format!("scan_{i:03}.png")))
            .unwrap();
    }
    dir
}

fn fast_config(out: &Path) -> edgequake_pdf2html::PipelineConfigBuilder {
    PipelineConfig::builder()
        .output_dir(out)
        .output_stem("doc")
        .poll_interval(Duration::from_millis(1))
        .processing_timeout(Duration::from_millis(60))
        .delete_spacing(Duration::ZERO)
        .call_retry(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        })
}

/// Page number encoded in an artifact or handle name (`page_00007`).
fn page_of(name: &str) -> usize {
    let start = name.find("page_").map(|i| i + 5).unwrap_or(name.len());
    name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

// ── Fake file store ──────────────────────────────────────────────────────

#[derive(Default)]
struct FakeStore {
    counter: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    /// Pages whose first upload is rejected.
    fail_once: Mutex<HashSet<usize>>,
    /// Pages whose upload is always rejected.
    rejected: HashSet<usize>,
    /// Remaining transient upload failures per page.
    transient: Mutex<HashMap<usize, usize>>,
    /// Pages that never leave the processing state.
    stuck: HashSet<usize>,
    quota: bool,
    /// Cancel this token once this many uploads have been accepted.
    cancel_after: Option<(usize, CancelToken)>,
    /// Cancel this token on the first status poll.
    cancel_on_status: Option<CancelToken>,
    status_calls: AtomicUsize,
    delay: Duration,
}

impl FakeStore {
    fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Every uploaded handle was deleted, and none twice.
    fn assert_each_deleted_once(&self) {
        let mut uploaded = self.uploaded();
        let mut deleted = self.deleted();
        uploaded.sort();
        deleted.sort();
        assert_eq!(uploaded, deleted);
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn upload(
        &self,
        path: &Path,
        _display_name: &str,
        mime_type: &str,
    ) -> Result<RemoteFile, RemoteError> {
        if self.quota {
            return Err(RemoteError::QuotaExhausted("daily file quota".into()));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        let page = page_of(&file_name);
        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(left) = transient.get_mut(&page).filter(|n| **n > 0) {
                *left -= 1;
                return Err(RemoteError::transient(TransientKind::Unavailable, "503"));
            }
        }
        if self.rejected.contains(&page) {
            return Err(RemoteError::Rejected {
                status: 400,
                detail: format!("unsupported {file_name}"),
            });
        }
        if self.fail_once.lock().unwrap().remove(&page) {
            return Err(RemoteError::Rejected {
                status: 400,
                detail: format!("bad upload of {file_name}"),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("files/{n:03}-{file_name}");
        let accepted = {
            let mut uploaded = self.uploaded.lock().unwrap();
            uploaded.push(name.clone());
            uploaded.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if accepted >= *after {
                token.cancel();
            }
        }

        let state = if self.stuck.contains(&page) {
            RemoteFileState::Processing
        } else {
            RemoteFileState::Active
        };
        Ok(RemoteFile {
            handle: RemoteHandle {
                uri: format!("https://files.example/{name}"),
                name,
                mime_type: mime_type.to_string(),
            },
            state,
        })
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteFile, RemoteError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_status {
            token.cancel();
        }
        let state = if self.stuck.contains(&page_of(&handle.name)) {
            RemoteFileState::Processing
        } else {
            RemoteFileState::Active
        };
        Ok(RemoteFile {
            handle: handle.clone(),
            state,
        })
    }

    async fn delete(&self, handle: &RemoteHandle) -> Result<(), RemoteError> {
        self.deleted.lock().unwrap().push(handle.name.clone());
        Ok(())
    }
}

// ── Fake generation service ──────────────────────────────────────────────

#[derive(Default)]
struct FakeGenerator {
    /// (page, model) of every call.
    calls: Mutex<Vec<(usize, String)>>,
    /// Pages truncated unless an output-token allowance is set.
    truncate: HashSet<usize>,
    /// Pages that always fail.
    broken: HashSet<usize>,
    /// Pages whose first call is a transient error.
    flaky: Mutex<HashSet<usize>>,
    fail_all: bool,
    quota: bool,
    /// Cancel this token when the first call arrives.
    cancel_on_call: Option<CancelToken>,
    delay: Duration,
}

impl FakeGenerator {
    fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationService for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, RemoteError> {
        let page = page_of(&request.file.name);
        self.calls
            .lock()
            .unwrap()
            .push((page, request.profile.model.clone()));
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        tokio::time::sleep(self.delay).await;

        if self.quota {
            return Err(RemoteError::QuotaExhausted("tokens per day".into()));
        }
        if self.fail_all || self.broken.contains(&page) {
            return Err(RemoteError::Rejected {
                status: 400,
                detail: format!("cannot read page {page}"),
            });
        }
        if self.flaky.lock().unwrap().remove(&page) {
            return Err(RemoteError::transient(TransientKind::Unavailable, "503"));
        }
        if self.truncate.contains(&page) && request.profile.max_output_tokens.is_none() {
            return Ok(GenerationResponse {
                text: "```html\n<p>cut off".into(),
                finish_reason: FinishReason::MaxTokens,
            });
        }
        Ok(GenerationResponse {
            text: format!("Here you go:\n```html\n<p>Body of page {page}</p>\n```\n"),
            finish_reason: FinishReason::Stop,
        })
    }
}

// ── Recording observer ───────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    completions: Mutex<Vec<Completion>>,
    lines: Mutex<Vec<StatusLine>>,
}

impl PipelineObserver for Recorder {
    fn on_status(&self, line: &StatusLine) {
        self.lines.lock().unwrap().push(line.clone());
    }

    fn on_complete(&self, completion: &Completion, _status_log: &[StatusLine]) {
        self.completions.lock().unwrap().push(completion.clone());
    }
}

impl Recorder {
    fn only_completion(&self) -> Completion {
        let completions = self.completions.lock().unwrap();
        assert_eq!(completions.len(), 1, "exactly one completion signal");
        completions[0].clone()
    }
}

struct Harness {
    store: Arc<FakeStore>,
    generator: Arc<FakeGenerator>,
    recorder: Arc<Recorder>,
    pages: TempDir,
    out: TempDir,
}

impl Harness {
    fn new(pages: usize, store: FakeStore, generator: FakeGenerator) -> Self {
        Self {
            store: Arc::new(store),
            generator: Arc::new(generator),
            recorder: Arc::new(Recorder::default()),
            pages: page_dir(pages),
            out: tempfile::tempdir().unwrap(),
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        let backends = Backends {
            rasterizer: Arc::new(DirectoryRasterizer::open(self.pages.path()).unwrap()),
            store: self.store.clone(),
            generator: self.generator.clone(),
            secret: None,
        };
        Pipeline::new(config, backends).with_observer(self.recorder.clone())
    }

    async fn run(&self, config: PipelineConfig) -> Result<PipelineOutput, PipelineError> {
        self.pipeline(config).run(CancelToken::new()).await
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn selected_pages_are_converted_in_order() {
    let h = Harness::new(10, FakeStore::default(), FakeGenerator::default());
    let config = fast_config(h.out.path()).page_range("1-3,5,7-").build().unwrap();
    let output = h.run(config).await.unwrap();

    assert!(!output.locator.partial);
    assert_eq!(output.locator.path, h.out.path().join("doc.html"));
    assert_eq!((output.stats.source_pages, output.stats.selected_pages), (10, 8));

    let mut pages: Vec<usize> = h.generator.calls().iter().map(|(p, _)| *p).collect();
    pages.sort();
    assert_eq!(pages, vec![1, 2, 3, 5, 7, 8, 9, 10]);

    let html = std::fs::read_to_string(&output.locator.path).unwrap();
    let positions: Vec<usize> = [1, 2, 3, 5, 7, 8, 9, 10]
        .iter()
        .map(|p| html.find(&format!("<p>Body of page {p}</p>")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(!html.contains("Body of page 4"));
    assert_eq!(html.matches("page-separator").count(), 7);

    assert!(matches!(h.recorder.only_completion(), Completion::Complete { .. }));
    h.store.assert_each_deleted_once();
    assert!(output.cleanup.is_clean());
    assert!(output.cleanup.work_dir_removed);
}

#[tokio::test]
async fn invalid_range_fails_before_any_remote_call() {
    let h = Harness::new(3, FakeStore::default(), FakeGenerator::default());
    let config = fast_config(h.out.path()).page_range("2-9").build().unwrap();
    let err = h.run(config).await.unwrap_err();

    assert!(matches!(err, PipelineError::InvalidPageRange { .. }));
    assert!(h.store.uploaded().is_empty());
    assert!(h.generator.calls().is_empty());
    assert!(matches!(
        h.recorder.only_completion(),
        Completion::Failed { .. }
    ));
}

#[tokio::test]
async fn failed_uploads_are_retried_in_a_second_round() {
    let store = FakeStore {
        fail_once: Mutex::new([2, 7].into_iter().collect()),
        delay: Duration::from_millis(5),
        ..Default::default()
    };
    let h = Harness::new(10, store, FakeGenerator::default());
    let config = fast_config(h.out.path()).upload_workers(3).build().unwrap();
    let output = h.run(config).await.unwrap();

    assert!(h.store.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(output.stats.uploaded_pages, 10);
    assert_eq!(output.stats.upload_rounds, 2);
    assert_eq!(h.store.uploaded().len(), 10);
    assert!(!output.locator.partial);
    h.store.assert_each_deleted_once();
}

#[tokio::test]
async fn transient_upload_failures_outlasting_call_retries_recover_next_round() {
    // Three failures each: more than the two call-level retries allow.
    let store = FakeStore {
        transient: Mutex::new([(2, 3), (7, 3)].into_iter().collect()),
        delay: Duration::from_millis(5),
        ..Default::default()
    };
    let h = Harness::new(10, store, FakeGenerator::default());
    let config = fast_config(h.out.path()).upload_workers(3).build().unwrap();
    let output = h.run(config).await.unwrap();

    assert!(h.store.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(output.stats.uploaded_pages, 10);
    assert_eq!(output.stats.upload_rounds, 2);
    assert!(h.store.transient.lock().unwrap().values().all(|n| *n == 0));
    assert_eq!(h.store.uploaded().len(), 10);
    assert!(!output.locator.partial);
    h.store.assert_each_deleted_once();
}

#[tokio::test]
async fn upload_survivors_and_permanent_failures_cover_every_artifact() {
    let pages = page_dir(4);
    let work = tempfile::tempdir().unwrap();
    let mut artifacts: Vec<PathBuf> = (1..=4)
        .map(|i| {
            let dst = work.path().join(format!("page_{i:05}.png"));
            std::fs::copy(pages.path().join(format!("scan_{i:03}.png")), &dst).unwrap();
            dst
        })
        .collect();
    for i in 5..=6 {
        let dst = work.path().join(format!("page_{i:05}.qqzz"));
        std::fs::write(&dst, b"raw").unwrap();
        artifacts.push(dst);
    }

    let store = Arc::new(FakeStore {
        rejected: [3].into_iter().collect(),
        ..Default::default()
    });
    let registry = Arc::new(HandleRegistry::new());
    let out = tempfile::tempdir().unwrap();
    let config = fast_config(out.path()).upload_workers(2).build().unwrap();
    let coordinator = UploadCoordinator::new(
        store.clone(),
        registry.clone(),
        &config,
        "doc",
        Reporter::default(),
        CancelToken::new(),
    );
    let report = coordinator.upload(&artifacts).await.unwrap();

    assert_eq!(report.survivors(), 3);
    assert_eq!(report.permanent_failures(), 3);
    assert_eq!(report.survivors() + report.permanent_failures(), artifacts.len());
    assert_eq!(report.records.len(), artifacts.len());
    assert_eq!(report.rounds, 2);
    assert_eq!(registry.len(), 3);
    assert!(!report.handles.contains_key(&artifacts[2]));
}

#[tokio::test]
async fn cancellation_while_polling_deletes_the_pending_upload() {
    let cancel = CancelToken::new();
    let store = FakeStore {
        stuck: [1, 2, 3].into_iter().collect(),
        cancel_on_status: Some(cancel.clone()),
        ..Default::default()
    };
    let h = Harness::new(3, store, FakeGenerator::default());
    let config = fast_config(h.out.path())
        .upload_workers(1)
        .processing_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    let err = h.pipeline(config).run(cancel).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { phase: Phase::Upload }));
    assert_eq!(h.store.status_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.uploaded().len(), 1);
    h.store.assert_each_deleted_once();
    assert!(h.generator.calls().is_empty());
    assert!(h
        .recorder
        .lines
        .lock()
        .unwrap()
        .iter()
        .all(|l| !l.message.contains("still processing")));
    assert_eq!(h.recorder.only_completion(), Completion::Cancelled);
}

#[tokio::test]
async fn truncated_page_is_escalated_and_lands_in_its_slot() {
    let generator = FakeGenerator {
        truncate: [2].into_iter().collect(),
        ..Default::default()
    };
    let h = Harness::new(3, FakeStore::default(), generator);
    let config = fast_config(h.out.path()).build().unwrap();
    let escalation_model = config.escalation_profile.model.clone();
    let output = h.run(config).await.unwrap();

    let page2: Vec<String> = h
        .generator
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == 2)
        .map(|(_, m)| m)
        .collect();
    assert_eq!(page2.len(), 2);
    assert_eq!(page2[1], escalation_model);
    assert_ne!(page2[0], escalation_model);
    assert_eq!(output.stats.escalated_pages, 1);
    assert_eq!(output.stats.generation_rounds, 2);

    let html = std::fs::read_to_string(&output.locator.path).unwrap();
    let p1 = html.find("Body of page 1").unwrap();
    let p2 = html.find("Body of page 2").unwrap();
    let p3 = html.find("Body of page 3").unwrap();
    assert!(p1 < p2 && p2 < p3);
    assert!(!html.contains("cut off"));
}

#[tokio::test]
async fn transient_errors_are_retried_within_the_call() {
    let generator = FakeGenerator {
        flaky: Mutex::new([1, 2].into_iter().collect()),
        ..Default::default()
    };
    let h = Harness::new(2, FakeStore::default(), generator);
    let output = h.run(fast_config(h.out.path()).build().unwrap()).await.unwrap();

    assert_eq!(h.generator.calls().len(), 4);
    assert_eq!(output.stats.generation_rounds, 1);
    assert!(!output.locator.partial);
}

#[tokio::test]
async fn missing_pages_give_a_partial_document() {
    let generator = FakeGenerator {
        broken: [2, 5, 8].into_iter().collect(),
        ..Default::default()
    };
    let h = Harness::new(8, FakeStore::default(), generator);
    let config = fast_config(h.out.path()).title("Scans").build().unwrap();
    let output = h.run(config).await.unwrap();

    assert!(output.locator.partial);
    assert_eq!((output.locator.pages_rendered, output.locator.pages_total), (5, 8));
    assert_eq!(output.locator.path, h.out.path().join("doc_partial.html"));
    assert!(!h.out.path().join("doc.html").exists());

    let html = std::fs::read_to_string(&output.locator.path).unwrap();
    assert!(html.contains("<title>Scans (Partial)</title>"));
    for p in [2, 5, 8] {
        assert!(html.contains(&format!("Content could not be extracted for page {p}.")));
    }
    let p1 = html.find("Body of page 1").unwrap();
    let hole = html.find("extracted for page 2.").unwrap();
    let p3 = html.find("Body of page 3").unwrap();
    assert!(p1 < hole && hole < p3);

    // one initial call and one retry round per broken page
    let broken_calls = h.generator.calls().iter().filter(|(p, _)| [2, 5, 8].contains(p)).count();
    assert_eq!(broken_calls, 6);
    assert!(matches!(h.recorder.only_completion(), Completion::Partial { .. }));
}

#[tokio::test]
async fn every_handle_is_deleted_once_when_all_pages_fail() {
    let generator = FakeGenerator {
        fail_all: true,
        ..Default::default()
    };
    let h = Harness::new(4, FakeStore::default(), generator);
    let err = h.run(fast_config(h.out.path()).build().unwrap()).await.unwrap_err();

    assert!(matches!(err, PipelineError::AllPagesFailed { attempted: 4, rounds: 2, .. }));
    assert_eq!(h.store.uploaded().len(), 4);
    h.store.assert_each_deleted_once();
    assert_eq!(std::fs::read_dir(h.out.path()).unwrap().count(), 0);
    assert!(matches!(h.recorder.only_completion(), Completion::Failed { .. }));
}

#[tokio::test]
async fn cancellation_during_upload_stops_new_uploads_and_cleans_up() {
    let cancel = CancelToken::new();
    let store = FakeStore {
        cancel_after: Some((2, cancel.clone())),
        ..Default::default()
    };
    let h = Harness::new(6, store, FakeGenerator::default());
    let config = fast_config(h.out.path()).upload_workers(1).build().unwrap();
    let err = h.pipeline(config).run(cancel).await.unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(h.store.uploaded().len(), 2);
    h.store.assert_each_deleted_once();
    assert!(h.generator.calls().is_empty());
    assert_eq!(h.recorder.only_completion(), Completion::Cancelled);
}

#[tokio::test]
async fn cancellation_during_generation_cleans_up_every_handle() {
    let cancel = CancelToken::new();
    let generator = FakeGenerator {
        cancel_on_call: Some(cancel.clone()),
        ..Default::default()
    };
    let h = Harness::new(3, FakeStore::default(), generator);
    let config = fast_config(h.out.path()).generation_workers(1).build().unwrap();
    let err = h.pipeline(config).run(cancel).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { phase: Phase::Generation }));
    assert_eq!(h.generator.calls().len(), 1);
    assert_eq!(h.store.uploaded().len(), 3);
    h.store.assert_each_deleted_once();
    assert_eq!(std::fs::read_dir(h.out.path()).unwrap().count(), 0);
    assert_eq!(h.recorder.only_completion(), Completion::Cancelled);
}

#[tokio::test]
async fn quota_exhaustion_ends_the_run_without_retry() {
    let generator = FakeGenerator {
        quota: true,
        ..Default::default()
    };
    let h = Harness::new(3, FakeStore::default(), generator);
    let config = fast_config(h.out.path()).generation_workers(1).build().unwrap();
    let err = h.run(config).await.unwrap_err();

    match &err {
        PipelineError::QuotaExhausted { detail } => assert!(detail.contains("tokens per day")),
        other => panic!("unexpected {other:?}"),
    }
    // the round in flight finishes, nothing is retried
    assert_eq!(h.generator.calls().len(), 3);
    h.store.assert_each_deleted_once();
    match h.recorder.only_completion() {
        Completion::Failed { kind, .. } => {
            assert_eq!(kind, edgequake_pdf2html::ErrorKind::QuotaExhausted)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn upload_quota_is_fatal() {
    let store = FakeStore {
        quota: true,
        ..Default::default()
    };
    let h = Harness::new(2, store, FakeGenerator::default());
    let err = h.run(fast_config(h.out.path()).build().unwrap()).await.unwrap_err();
    assert!(matches!(err, PipelineError::QuotaExhausted { .. }));
    assert!(h.generator.calls().is_empty());
}

#[tokio::test]
async fn stuck_upload_times_out_and_is_deleted() {
    let store = FakeStore {
        stuck: [1].into_iter().collect(),
        ..Default::default()
    };
    let h = Harness::new(2, store, FakeGenerator::default());
    let output = h.run(fast_config(h.out.path()).build().unwrap()).await.unwrap();

    // page 1 was uploaded once per round and discarded each time
    let page1 = h.store.uploaded().iter().filter(|n| page_of(n) == 1).count();
    assert_eq!(page1, 2);
    h.store.assert_each_deleted_once();
    assert!(output.locator.partial);
    assert_eq!(output.locator.pages_rendered, 1);
    assert!(h
        .recorder
        .lines
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.message.contains("still processing")));
}

/// Writes artifacts with an extension no content type maps to.
struct OpaqueRasterizer;

impl Rasterizer for OpaqueRasterizer {
    fn source_name(&self) -> String {
        "opaque".into()
    }

    fn page_count(&self) -> Result<usize, PipelineError> {
        Ok(2)
    }

    fn rasterize(
        &self,
        page_index: usize,
        out_dir: &Path,
        _secret: Option<&SecretCallback>,
    ) -> Result<PathBuf, RasterError> {
        let path = out_dir.join(format!("page_{:05}.qqzz", page_index + 1));
        std::fs::write(&path, b"raw").map_err(|source| RasterError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[tokio::test]
async fn unknown_content_type_is_never_uploaded() {
    let store = Arc::new(FakeStore::default());
    let out = tempfile::tempdir().unwrap();
    let backends = Backends {
        rasterizer: Arc::new(OpaqueRasterizer),
        store: store.clone(),
        generator: Arc::new(FakeGenerator::default()),
        secret: None,
    };
    let err = Pipeline::new(fast_config(out.path()).build().unwrap(), backends)
        .run(CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AllUploadsFailed { attempted: 2, .. }));
    assert!(store.uploaded().is_empty());
    assert!(store.deleted().is_empty());
}

#[tokio::test]
async fn work_files_are_removed_after_the_run() {
    let h = Harness::new(2, FakeStore::default(), FakeGenerator::default());
    let work = tempfile::tempdir().unwrap();
    let config = fast_config(h.out.path()).work_dir_root(work.path()).build().unwrap();
    let output = h.run(config).await.unwrap();

    assert_eq!(output.cleanup.local_removed, 2);
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn event_stream_ends_with_the_completion() {
    let h = Harness::new(2, FakeStore::default(), FakeGenerator::default());
    let pipeline = h.pipeline(fast_config(h.out.path()).build().unwrap());
    let (handle, events) = spawn_with_events(pipeline, CancelToken::new());
    let events: Vec<PipelineEvent> = events.collect().await;
    let output = handle.await.unwrap().unwrap();

    assert!(events.iter().any(|e| matches!(e, PipelineEvent::Progress(_))));
    match events.last() {
        Some(PipelineEvent::Complete { completion, status_log }) => {
            assert!(completion.is_success());
            assert_eq!(status_log, &output.status_log);
        }
        other => panic!("unexpected last event {other:?}"),
    }
}

/// Copies page images only when the secret callback answers "sesame".
struct ProtectedRasterizer {
    pages: PathBuf,
}

impl Rasterizer for ProtectedRasterizer {
    fn source_name(&self) -> String {
        "sealed".into()
    }

    fn page_count(&self) -> Result<usize, PipelineError> {
        Ok(2)
    }

    fn rasterize(
        &self,
        page_index: usize,
        out_dir: &Path,
        secret: Option<&SecretCallback>,
    ) -> Result<PathBuf, RasterError> {
        if secret.and_then(|cb| cb("sealed")).as_deref() != Some("sesame") {
            return Err(RasterError::SecretRequired("sealed".into()));
        }
        let src = self.pages.join(format!("scan_{:03}.png", page_index + 1));
        let dst = out_dir.join(format!("page_{:05}.png", page_index + 1));
        std::fs::copy(&src, &dst).map_err(|source| RasterError::Io {
            path: src.clone(),
            source,
        })?;
        Ok(dst)
    }
}

#[tokio::test]
async fn protected_source_needs_the_secret_callback() {
    let pages = page_dir(2);
    let store = Arc::new(FakeStore::default());
    let out = tempfile::tempdir().unwrap();
    let backends = |secret: Option<SecretCallback>| Backends {
        rasterizer: Arc::new(ProtectedRasterizer {
            pages: pages.path().to_path_buf(),
        }),
        store: store.clone(),
        generator: Arc::new(FakeGenerator::default()),
        secret,
    };

    let recorder = Arc::new(Recorder::default());
    let err = Pipeline::new(fast_config(out.path()).build().unwrap(), backends(None))
        .with_observer(recorder.clone())
        .run(CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SecretRequired { ref document } if document == "sealed"));
    assert_eq!(err.kind(), edgequake_pdf2html::ErrorKind::Configuration);
    assert!(store.uploaded().is_empty());
    assert!(matches!(recorder.only_completion(), Completion::Failed { .. }));

    let secret: SecretCallback = Arc::new(|_: &str| Some("sesame".to_string()));
    let output = Pipeline::new(fast_config(out.path()).build().unwrap(), backends(Some(secret)))
        .run(CancelToken::new())
        .await
        .unwrap();
    assert!(!output.locator.partial);
    assert_eq!(output.locator.pages_rendered, 2);
    store.assert_each_deleted_once();
}
