//! Error taxonomy for metadata extraction, download orchestration, and
//! request validation.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Failures of a synchronous metadata fetch. All of them are terminal for the
/// call; retries happen inside the external tool only.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid YouTube URL format")]
    InvalidUrl,
    #[error("Failed to get video info: {0}")]
    Extraction(String),
    #[error("Failed to parse video info: {0}")]
    MalformedMetadata(#[from] serde_json::Error),
    #[error("Failed to spawn yt-dlp: {0}")]
    ToolUnavailable(#[source] io::Error),
}

/// Failures of one download run. By the time one of these is returned the
/// job record has already been moved to `failed` (or removed, when
/// cancelled).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to spawn yt-dlp: {0}")]
    ToolUnavailable(#[source] io::Error),
    #[error("{0}")]
    ExitStatus(String),
    #[error("reading yt-dlp output: {0}")]
    Io(#[from] io::Error),
    #[error("download {0} was cancelled")]
    Cancelled(u64),
    #[error("yt-dlp exited without reporting a completed file")]
    Incomplete,
}

/// A single schema violation in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

/// Request body failed validation. Lists every violation, not just the first.
#[derive(Debug, Clone, Error)]
#[error("Invalid request data")]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}
