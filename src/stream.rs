//! Event-stream API: run a pipeline in the background and consume its
//! status, progress and completion as a `Stream`.
//!
//! ## Why stream?
//!
//! Runs take minutes. A front end that owns an event loop (a TUI, a web
//! socket handler, a GUI bridge) would rather poll a stream than implement
//! [`PipelineObserver`] and marshal calls across threads itself.
//!
//! Events arrive in emission order. The stream ends after the
//! [`PipelineEvent::Complete`] event, once the run has dropped its observer.

use crate::cancel::CancelToken;
use crate::convert::Pipeline;
use crate::error::PipelineError;
use crate::output::PipelineOutput;
use crate::progress::{Completion, PipelineObserver, Progress, StatusLine};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// One observer callback, captured as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(StatusLine),
    Progress(Progress),
    Complete {
        completion: Completion,
        status_log: Vec<StatusLine>,
    },
}

/// Observer that forwards every callback into an unbounded channel.
///
/// Sends never block; a dropped receiver is ignored.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelObserver {
    /// Create the observer and the stream that receives its events.
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            EventStream {
                inner: UnboundedReceiverStream::new(rx),
            },
        )
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_status(&self, line: &StatusLine) {
        let _ = self.tx.send(PipelineEvent::Status(line.clone()));
    }

    fn on_progress(&self, progress: &Progress) {
        let _ = self.tx.send(PipelineEvent::Progress(progress.clone()));
    }

    fn on_complete(&self, completion: &Completion, status_log: &[StatusLine]) {
        let _ = self.tx.send(PipelineEvent::Complete {
            completion: completion.clone(),
            status_log: status_log.to_vec(),
        });
    }
}

/// Stream of [`PipelineEvent`]s from one run.
pub struct EventStream {
    inner: UnboundedReceiverStream<PipelineEvent>,
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Spawn `pipeline` on the current runtime and return its events.
///
/// The pipeline's own observer is replaced by the channel. Await the handle
/// for the final result; the stream carries everything else.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2html::stream::{spawn_with_events, PipelineEvent};
/// use edgequake_pdf2html::{CancelToken, Pipeline};
/// use futures::StreamExt;
///
/// # async fn demo(pipeline: Pipeline) {
/// let (handle, mut events) = spawn_with_events(pipeline, CancelToken::new());
/// while let Some(event) = events.next().await {
///     if let PipelineEvent::Status(line) = event {
///         println!("{line}");
///     }
/// }
/// let _ = handle.await;
/// # }
/// ```
pub fn spawn_with_events(
    pipeline: Pipeline,
    cancel: CancelToken,
) -> (JoinHandle<Result<PipelineOutput, PipelineError>>, EventStream) {
    let (observer, events) = ChannelObserver::new();
    let pipeline = pipeline.with_observer(Arc::new(observer));
    let handle = tokio::spawn(async move { pipeline.run(cancel).await });
    (handle, events)
}
