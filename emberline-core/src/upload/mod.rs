//! Upload pipeline: blob rendering, transport, and single-flight coordination
//!
//! The pipeline is two-stage: events accumulate in the durable queue until an
//! upload call cuts them into an immutable blob, and each blob is delivered
//! at most once concurrently per API key. A blob is deleted, together with
//! everything it consumed, only after a non-5xx response; server errors
//! leave it queued for the next explicit upload call.

mod client;
pub mod payload;
mod uploader;

pub use client::{outcome_for_status, UploadClient, UploadOutcome};
pub use uploader::{BlobTransport, SyncUploader, UploadRun, UploadStats, Uploader};
