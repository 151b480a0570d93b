//! Per-page work items and the ordered result buffer.
//!
//! A page flows through three item types: a [`PageTask`] (created once when
//! the page is selected and rasterised), an [`UploadRecord`] (owned by the
//! upload coordinator while its phase runs) and a [`GenerationTask`] (one per
//! page that ended the upload phase active). All three carry the same
//! `order_index`, assigned at [`PageTask`] creation and never changed; it is
//! the only key used to put results back in document order.

use crate::config::GenerationProfile;
use crate::error::FailureReason;
use crate::remote::RemoteHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

// ── Phases ───────────────────────────────────────────────────────────────

/// One stage of a pipeline run. Phases run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Rasterization,
    Upload,
    Generation,
    Assembly,
    Cleanup,
}

impl Phase {
    /// Share of the overall progress bar owned by this phase, in percent.
    pub fn progress_span(self) -> (u8, u8) {
        match self {
            Phase::Rasterization => (0, 30),
            Phase::Upload => (30, 60),
            Phase::Generation => (60, 90),
            Phase::Assembly => (90, 95),
            Phase::Cleanup => (95, 100),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Phase::Rasterization => 0,
            Phase::Upload => 1,
            Phase::Generation => 2,
            Phase::Assembly => 3,
            Phase::Cleanup => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Rasterization,
            1 => Phase::Upload,
            2 => Phase::Generation,
            3 => Phase::Assembly,
            _ => Phase::Cleanup,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Rasterization => "rasterization",
            Phase::Upload => "upload",
            Phase::Generation => "generation",
            Phase::Assembly => "assembly",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

// ── Item state machine ───────────────────────────────────────────────────

/// Lifecycle of an upload or generation item within one run.
///
/// ```text
/// Pending ──▶ InFlight ──▶ Active
///    ▲            │
///    │            ├──────▶ Cancelled
///    │            ▼
///    └──────── Failed   (next round of the same phase)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InFlight,
    Active,
    Failed,
    Cancelled,
}

impl ItemState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (ItemState::Pending, ItemState::InFlight)
                | (ItemState::Pending, ItemState::Cancelled)
                | (ItemState::InFlight, ItemState::Active)
                | (ItemState::InFlight, ItemState::Failed)
                | (ItemState::InFlight, ItemState::Cancelled)
                | (ItemState::Failed, ItemState::Pending)
        )
    }

    /// `Active` and `Cancelled` end the item's life within the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Active | ItemState::Cancelled)
    }
}

// ── Page tasks ───────────────────────────────────────────────────────────

/// A selected, rasterised page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTask {
    /// Position among the selected pages, in source-page order.
    pub order_index: usize,
    /// 1-indexed page number in the source document.
    pub page_number: usize,
    /// Local image artifact produced by the rasterizer.
    pub artifact: PathBuf,
}

/// Upload-phase bookkeeping for one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub artifact: PathBuf,
    pub handle: Option<RemoteHandle>,
    pub state: ItemState,
    /// Most recent failure, kept for the final report.
    pub last_failure: Option<FailureReason>,
    /// Rounds this item has been submitted in.
    pub attempts: u32,
}

impl UploadRecord {
    pub fn new(artifact: PathBuf) -> Self {
        Self {
            artifact,
            handle: None,
            state: ItemState::Pending,
            last_failure: None,
            attempts: 0,
        }
    }

    /// Move to `next`, refusing illegal transitions.
    ///
    /// Returns `false` (and leaves the state untouched) when the transition
    /// is not allowed by the item state machine.
    pub fn advance(&mut self, next: ItemState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// One page to send to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub order_index: usize,
    pub page_number: usize,
    pub handle: RemoteHandle,
    /// Local artifact, read for side-channel metadata and the preview.
    pub artifact: PathBuf,
    /// Current generation profile; replaced on escalation.
    pub profile: GenerationProfile,
}

/// What one generation worker hands back to its coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Index echoed by the worker. Informational only: the coordinator
    /// always places the result by the index it tracked itself.
    pub order_index: usize,
    pub page_number: usize,
    pub content: Option<String>,
    /// Base64-encoded page image.
    pub auxiliary_preview: Option<String>,
    pub failure: Option<FailureReason>,
}

impl GenerationResult {
    pub fn failed(task: &GenerationTask, reason: FailureReason) -> Self {
        Self {
            order_index: task.order_index,
            page_number: task.page_number,
            content: None,
            auxiliary_preview: None,
            failure: Some(reason),
        }
    }
}

// ── Result buffer ────────────────────────────────────────────────────────

/// Successful output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub page_number: usize,
    pub body: String,
    pub preview: Option<String>,
    /// Model that produced the body (differs from the base model after escalation).
    pub model: String,
}

#[derive(Debug)]
struct Slot {
    page_number: usize,
    content: OnceLock<PageContent>,
}

/// Pre-sized, write-once result slots addressed by `order_index`.
///
/// One slot exists per selected page, so pages lost in any phase stay
/// visible as empty slots. A slot is filled only when its page
/// eventually succeeds; [`OnceLock`] guarantees it is never written twice,
/// and distinct slots can be filled from any thread without further
/// synchronisation.
#[derive(Debug)]
pub struct ResultBuffer {
    slots: Vec<Slot>,
}

/// Returned by [`ResultBuffer::fill`] when a slot cannot be written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot {index} is out of range (buffer has {len} slots)")]
    OutOfRange { index: usize, len: usize },
    #[error("slot {0} is already filled")]
    AlreadyFilled(usize),
}

impl ResultBuffer {
    /// One empty slot per selected page. `page_numbers[i]` is the page
    /// whose result belongs in slot `i`.
    pub fn new(page_numbers: impl IntoIterator<Item = usize>) -> Self {
        let slots = page_numbers
            .into_iter()
            .map(|page_number| Slot {
                page_number,
                content: OnceLock::new(),
            })
            .collect();
        Self { slots }
    }

    /// Write `content` into slot `index`.
    pub fn fill(&self, index: usize, content: PageContent) -> Result<(), SlotError> {
        let slot = self.slots.get(index).ok_or(SlotError::OutOfRange {
            index,
            len: self.slots.len(),
        })?;
        slot.content
            .set(content)
            .map_err(|_| SlotError::AlreadyFilled(index))
    }

    pub fn get(&self, index: usize) -> Option<&PageContent> {
        self.slots.get(index).and_then(|s| s.content.get())
    }

    /// Page number recorded for slot `index` at creation.
    pub fn page_number(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|s| s.page_number)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.content.get().is_some()).count()
    }

    /// Slots in ascending order index: `(index, page_number, content)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, Option<&PageContent>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.page_number, s.content.get()))
    }

    /// Page numbers of empty slots.
    pub fn missing_pages(&self) -> Vec<usize> {
        self.iter()
            .filter(|(_, _, c)| c.is_none())
            .map(|(_, page, _)| page)
            .collect()
    }
}
