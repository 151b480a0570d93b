//! Pipeline stages for document-to-HTML conversion.
//!
//! Each submodule implements one step. Keeping stages separate makes each
//! independently testable and lets the orchestration in
//! [`crate::convert`] stay a short, linear sequence.
//!
//! ## Data Flow
//!
//! ```text
//! select ──▶ rasterize ──▶ upload ──▶ generate ──▶ assemble
//! (range)    (blocking)    (pool)     (pool)       (atomic write)
//!                                         │
//!                           extract + postprocess
//!
//! cleanup runs after all of them, on every exit path
//! ```
//!
//! 1. [`select`]    — parse the page-range string
//! 2. [`rasterize`] — produce one local image per selected page
//! 3. [`upload`]    — push images to the remote store, wait until active
//! 4. [`generate`]  — call the generation service per page, place results by order index
//! 5. [`extract`] and [`postprocess`] — pull markup out of responses and clean it
//! 6. [`assemble`]  — merge pages into one document, partial if pages are missing
//! 7. [`cleanup`]   — release local files and remote handles
//!
//! [`patch`] works on finished documents: it merges corrected pages into an
//! earlier output.
//!
//! [`pool`] and [`retry`] are the shared concurrency and backoff primitives.

pub mod assemble;
pub mod cleanup;
pub mod extract;
pub mod generate;
pub mod patch;
pub mod pool;
pub mod postprocess;
pub mod rasterize;
pub mod retry;
pub mod select;
pub mod upload;
