//! Remote collaborators: the file store pages are uploaded to and the
//! generation service that turns an uploaded page into markup.
//!
//! Both are object-safe async traits so the pipeline can hold them as
//! `Arc<dyn ...>` and tests can swap in in-memory fakes. [`gemini`] provides
//! the production implementation of both.

pub mod gemini;

use crate::config::GenerationProfile;
use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

pub use gemini::GeminiClient;

/// Reference to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Store-assigned resource name, e.g. `files/abc123`.
    pub name: String,
    /// URI the generation service uses to reference the file.
    pub uri: String,
    pub mime_type: String,
}

/// Processing state of an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFileState {
    Processing,
    Active,
    Failed,
    /// Any state the store reports that this crate does not model.
    Other(String),
}

impl RemoteFileState {
    pub fn label(&self) -> &str {
        match self {
            RemoteFileState::Processing => "PROCESSING",
            RemoteFileState::Active => "ACTIVE",
            RemoteFileState::Failed => "FAILED",
            RemoteFileState::Other(s) => s,
        }
    }
}

/// A handle plus its last observed processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub handle: RemoteHandle,
    pub state: RemoteFileState,
}

/// Remote file store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload one local file. The returned handle must be deleted later.
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        mime_type: &str,
    ) -> Result<RemoteFile, RemoteError>;

    /// Current processing state of an uploaded file.
    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteFile, RemoteError>;

    /// Delete an uploaded file. Returns [`RemoteError::NotFound`] if it is
    /// already gone; callers treat that as success.
    async fn delete(&self, handle: &RemoteHandle) -> Result<(), RemoteError>;
}

/// Why the generation service stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Output hit the token allowance.
    MaxTokens,
    Safety,
    Other(String),
    Unspecified,
}

impl FinishReason {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => FinishReason::Unspecified,
            Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("SAFETY") => FinishReason::Safety,
            Some("FINISH_REASON_UNSPECIFIED") => FinishReason::Unspecified,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::Safety => "SAFETY",
            FinishReason::Other(s) => s,
            FinishReason::Unspecified => "UNSPECIFIED",
        }
    }
}

/// One page-generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub profile: GenerationProfile,
    pub prompt: String,
    pub file: RemoteHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    /// Concatenated text of the first candidate. May be empty.
    pub text: String,
    pub finish_reason: FinishReason,
}

/// Content-generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, RemoteError>;
}

/// Every remote handle created during a run.
///
/// Handles are recorded the moment an upload returns, before any status
/// polling, so nothing created can escape cleanup. [`HandleRegistry::drain`]
/// hands each handle out exactly once.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Mutex<Vec<RemoteHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle. Registering the same name twice keeps one entry.
    pub fn register(&self, handle: RemoteHandle) {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !handles.iter().any(|h| h.name == handle.name) {
            handles.push(handle);
        }
    }

    /// Forget a handle that has already been deleted.
    pub fn remove(&self, name: &str) -> Option<RemoteHandle> {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pos = handles.iter().position(|h| h.name == name)?;
        Some(handles.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every registered handle, leaving the registry empty.
    pub fn drain(&self) -> Vec<RemoteHandle> {
        std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> RemoteHandle {
        RemoteHandle {
            name: name.into(),
            uri: format!("https://example.invalid/{name}"),
            mime_type: "image/png".into(),
        }
    }

    #[test]
    fn registry_dedups_and_drains_once() {
        let reg = HandleRegistry::new();
        reg.register(handle("files/a"));
        reg.register(handle("files/b"));
        reg.register(handle("files/a"));
        assert_eq!(reg.len(), 2);
        reg.register(handle("files/c"));
        assert_eq!(reg.remove("files/c").map(|h| h.name), Some("files/c".into()));
        assert!(reg.remove("files/c").is_none());

        let drained = reg.drain();
        assert_eq!(drained.len(), 2);
        assert!(reg.is_empty());
        assert!(reg.drain().is_empty());
    }

    #[test]
    fn finish_reason_parse() {
        assert_eq!(FinishReason::parse(Some("MAX_TOKENS")), FinishReason::MaxTokens);
        assert_eq!(FinishReason::parse(Some("STOP")), FinishReason::Stop);
        assert_eq!(FinishReason::parse(None), FinishReason::Unspecified);
        assert_eq!(
            FinishReason::parse(Some("RECITATION")).label(),
            "RECITATION"
        );
    }
}
