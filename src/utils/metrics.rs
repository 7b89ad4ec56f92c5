use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::task::{DiffOutcome, TaskError};

/// Run statistics collector, shared by the orchestrator and its reporters
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// A page that did not produce the expected artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    pub url_path: String,
    pub error: TaskError,
    pub attempts: u32,
}

/// Run statistics, written as `run_summary.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    /// Start time of the run
    pub start_time: DateTime<Utc>,

    /// Set once the run completed
    pub end_time: Option<DateTime<Utc>>,

    /// Start URL of the run
    pub start_url: String,

    /// Pages accepted by the crawl
    pub pages_discovered: usize,

    /// Successful captures
    pub captures: usize,

    /// Executions spent on captures, retries included
    pub capture_attempts: u32,

    /// Pages matching their reference capture
    pub unchanged_pages: Vec<String>,

    /// Pages that differ from their reference capture
    pub changed_pages: Vec<String>,

    /// Pages of the reference run missing from this run
    pub removed_pages: Vec<String>,

    /// Captures and diffs that failed for good
    pub failures: Vec<PageFailure>,

    /// HTTP status code counts of successful captures
    pub status_codes: BTreeMap<u16, usize>,
}

impl Metrics {
    fn new(start_url: &str) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            start_url: start_url.to_string(),
            pages_discovered: 0,
            captures: 0,
            capture_attempts: 0,
            unchanged_pages: vec![],
            changed_pages: vec![],
            removed_pages: vec![],
            failures: vec![],
            status_codes: BTreeMap::new(),
        }
    }

    /// Wall-clock duration of the run so far, in milliseconds
    pub fn duration_ms(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new(start_url: &str) -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::new(start_url))),
        }
    }

    /// Record a successful capture
    pub async fn record_capture(&self, status_code: u16, attempts: u32) {
        let mut metrics = self.metrics.lock().await;
        metrics.captures += 1;
        metrics.capture_attempts += attempts;
        *metrics.status_codes.entry(status_code).or_default() += 1;
    }

    /// Record a capture that exhausted its attempts or failed for good
    pub async fn record_capture_failure(&self, url_path: &str, error: TaskError, attempts: u32) {
        let mut metrics = self.metrics.lock().await;
        metrics.capture_attempts += attempts;
        metrics.failures.push(PageFailure {
            url_path: url_path.to_string(),
            error,
            attempts,
        });
    }

    /// Record a completed comparison
    pub async fn record_diff(&self, outcome: &DiffOutcome) {
        let mut metrics = self.metrics.lock().await;
        if outcome.differs {
            metrics.changed_pages.push(outcome.url_path.clone());
        } else {
            metrics.unchanged_pages.push(outcome.url_path.clone());
        }
    }

    /// Record a failed comparison; removed pages are tracked on their own
    pub async fn record_diff_failure(&self, url_path: &str, error: TaskError, attempts: u32) {
        let mut metrics = self.metrics.lock().await;
        match error {
            TaskError::RemovedPage(_) => metrics.removed_pages.push(url_path.to_string()),
            error => metrics.failures.push(PageFailure {
                url_path: url_path.to_string(),
                error,
                attempts,
            }),
        }
    }

    pub async fn set_pages_discovered(&self, count: usize) {
        self.metrics.lock().await.pages_discovered = count;
    }

    /// Stamp the end time and return the final, sorted statistics
    pub async fn finish(&self) -> Metrics {
        let mut metrics = self.metrics.lock().await;
        metrics.end_time = Some(Utc::now());
        metrics.unchanged_pages.sort();
        metrics.changed_pages.sort();
        metrics.removed_pages.sort();
        metrics.failures.sort_by(|a, b| a.url_path.cmp(&b.url_path));
        metrics.clone()
    }
}
