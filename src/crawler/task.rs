use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request to capture a single page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Canonical URL to capture
    pub url: String,

    /// Directory receiving the run artifacts
    pub output_dir: PathBuf,

    /// Reference run to diff against once the capture succeeds
    pub reference_dir: Option<PathBuf>,
}

/// Result of a successful capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    /// URL that was captured
    pub url: String,

    /// HTTP status code of the fetch
    pub status_code: u16,

    /// Content type of the response
    pub content_type: String,

    /// URL the fetch ended on after redirects; links resolve against it
    pub final_url: String,

    /// Raw hrefs found on the page, only populated for HTML responses
    pub links: Vec<String>,

    /// Screenshot written by the renderer
    pub screenshot: PathBuf,

    /// Timestamp when the page was captured
    pub captured_at: DateTime<Utc>,
}

/// Request to compare one page of a run against its reference capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    /// Artifact name shared by the run and the reference
    pub name: String,

    /// Path of the page, kept for reporting
    pub url_path: String,

    /// Directory holding the new run artifacts
    pub run_dir: PathBuf,

    /// Directory holding the reference artifacts
    pub reference_dir: PathBuf,
}

/// Result of a completed comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOutcome {
    pub name: String,
    pub url_path: String,

    /// Whether the diff tool reported any pixel difference
    pub differs: bool,

    /// Diff image, present only when `differs` is set
    pub diff_image: Option<PathBuf>,

    /// Diff log, always written
    pub diff_log: PathBuf,
}

/// Failure reported by a capture or diff handler
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum TaskError {
    /// Transient failure (timeout, network error, flaky upstream); worth another attempt
    #[error("transient failure: {0}")]
    Retryable(String),

    /// Real failure of the page or the tool; retrying will not help
    #[error("{0}")]
    Terminal(String),

    /// Page exists in the reference run but not in the new crawl
    #[error("page removed: {0}")]
    RemovedPage(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }
}
