//! Gemini REST backend for both remote seams.
//!
//! Files go through the resumable upload protocol of the File API
//! (`upload/v1beta/files`), are polled with `GET v1beta/files/{id}` until
//! they leave `PROCESSING`, referenced from `generateContent` by URI, and
//! deleted with `DELETE v1beta/files/{id}`.
//!
//! HTTP failures are classified into [`RemoteError`] by [`classify`] so the
//! pipeline's retry loop can tell transient trouble (rate limits, overload,
//! timeouts) from quota exhaustion, which is never retried.

use super::{
    FinishReason, GenerationRequest, GenerationResponse, GenerationService, RemoteFile,
    RemoteFileState, RemoteHandle, RemoteStore,
};
use crate::error::{PipelineError, RemoteError, TransientKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Client for the Gemini File and Generate Content APIs.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Build a client from `GOOGLE_API_KEY`.
    ///
    /// A missing or blank key is a configuration error raised before any
    /// remote work is attempted.
    pub fn from_env() -> Result<Self, PipelineError> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Self::new(key.trim()),
            _ => Err(PipelineError::MissingCredential {
                var: API_KEY_ENV.to_string(),
            }),
        }
    }

    /// Point the client at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::Rejected {
            status: status.as_u16(),
            detail: format!("unparseable response body: {e}"),
        })
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StartUpload<'a> {
    file: StartUploadFile<'a>,
}

#[derive(Debug, Serialize)]
struct StartUploadFile<'a> {
    display_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    state: Option<String>,
}

impl FileResource {
    fn into_remote(self, fallback_mime: &str) -> RemoteFile {
        let state = match self.state.as_deref() {
            Some("ACTIVE") => RemoteFileState::Active,
            Some("PROCESSING") => RemoteFileState::Processing,
            Some("FAILED") => RemoteFileState::Failed,
            Some(other) => RemoteFileState::Other(other.to_string()),
            None => RemoteFileState::Other("STATE_UNSPECIFIED".to_string()),
        };
        let mime_type = if self.mime_type.is_empty() {
            fallback_mime.to_string()
        } else {
            self.mime_type
        };
        RemoteFile {
            handle: RemoteHandle {
                name: self.name,
                uri: self.uri,
                mime_type,
            },
            state,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    File { file_data: FileData<'a> },
}

#[derive(Debug, Serialize)]
struct FileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

// ── Classification ───────────────────────────────────────────────────────

/// Map an HTTP error status and body onto [`RemoteError`].
pub fn classify(status: u16, body: &str) -> RemoteError {
    let (message, api_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (env.error.message, env.error.status),
        Err(_) => (body.trim().to_string(), String::new()),
    };
    let detail = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    };
    let lower = detail.to_lowercase();
    match status {
        429 if api_status == "RESOURCE_EXHAUSTED" || lower.contains("quota") => {
            RemoteError::QuotaExhausted(detail)
        }
        429 => RemoteError::transient(TransientKind::RateLimited, detail),
        408 | 504 => RemoteError::transient(TransientKind::Timeout, detail),
        503 => RemoteError::transient(TransientKind::Unavailable, detail),
        500 => RemoteError::transient(TransientKind::Internal, detail),
        404 => RemoteError::NotFound(detail),
        _ => RemoteError::Rejected { status, detail },
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::transient(TransientKind::Timeout, e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        RemoteError::transient(TransientKind::Unavailable, e.to_string())
    } else {
        RemoteError::transient(TransientKind::Internal, e.to_string())
    }
}

// ── Trait impls ──────────────────────────────────────────────────────────

#[async_trait]
impl RemoteStore for GeminiClient {
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
        mime_type: &str,
    ) -> Result<RemoteFile, RemoteError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::Local(format!("{}: {e}", path.display())))?;

        let start = self
            .http
            .post(self.url("upload/v1beta/files"))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&StartUpload {
                file: StartUploadFile { display_name },
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = start.status();
        if !status.is_success() {
            let body = start.text().await.unwrap_or_default();
            return Err(classify(status.as_u16(), &body));
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Rejected {
                status: status.as_u16(),
                detail: "upload session returned no upload URL".into(),
            })?;

        let len = bytes.len();
        let finish = self
            .http
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header(reqwest::header::CONTENT_LENGTH, len.to_string())
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        let resp: UploadResponse = Self::read_json(finish).await?;
        let file = resp.file.into_remote(mime_type);
        debug!("Uploaded {} ({} bytes) as {}", display_name, len, file.handle.name);
        Ok(file)
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteFile, RemoteError> {
        let resp = self
            .http
            .get(self.url(&format!("v1beta/{}", handle.name)))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let file: FileResource = Self::read_json(resp).await?;
        Ok(file.into_remote(&handle.mime_type))
    }

    async fn delete(&self, handle: &RemoteHandle) -> Result<(), RemoteError> {
        let resp = self
            .http
            .delete(self.url(&format!("v1beta/{}", handle.name)))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status.as_u16(), &body))
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, RemoteError> {
        let body = GenerateBody {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text {
                        text: &request.prompt,
                    },
                    Part::File {
                        file_data: FileData {
                            mime_type: &request.file.mime_type,
                            file_uri: &request.file.uri,
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: request.profile.temperature,
                max_output_tokens: request.profile.max_output_tokens,
            },
        };

        let resp = self
            .http
            .post(self.url(&format!(
                "v1beta/models/{}:generateContent",
                request.profile.model
            )))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let parsed: GenerateResponse = Self::read_json(resp).await?;
        Ok(flatten_response(parsed))
    }
}

fn flatten_response(resp: GenerateResponse) -> GenerationResponse {
    let Some(candidate) = resp.candidates.into_iter().next() else {
        return GenerationResponse {
            text: String::new(),
            finish_reason: FinishReason::Unspecified,
        };
    };
    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    GenerationResponse {
        text,
        finish_reason: FinishReason::parse(candidate.finish_reason.as_deref()),
    }
}
