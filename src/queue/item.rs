use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawler::task::{CaptureOutcome, CaptureRequest, DiffOutcome, DiffRequest, TaskError};

/// Kind tag of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Capture,
    Diff,
}

impl WorkKind {
    pub const ALL: [WorkKind; 2] = [WorkKind::Capture, WorkKind::Diff];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Capture => "capture",
            WorkKind::Diff => "diff",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capture" => Ok(WorkKind::Capture),
            "diff" => Ok(WorkKind::Diff),
            other => Err(format!("unknown work kind: {}", other)),
        }
    }
}

/// Lifecycle state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Queued,
    Active,
    Done,
    Failed,
}

/// What a work item asks for; the set of kinds is closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum WorkPayload {
    Capture(CaptureRequest),
    Diff(DiffRequest),
}

impl WorkPayload {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::Capture(_) => WorkKind::Capture,
            WorkPayload::Diff(_) => WorkKind::Diff,
        }
    }

    /// Short human readable label for logs
    pub fn label(&self) -> &str {
        match self {
            WorkPayload::Capture(request) => &request.url,
            WorkPayload::Diff(request) => &request.url_path,
        }
    }
}

/// Result payload of a successful item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "outcome", rename_all = "snake_case")]
pub enum WorkResult {
    Captured(CaptureOutcome),
    Diffed(DiffOutcome),
}

/// What a handler hands back on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub result: WorkResult,

    /// Follow-up work, enqueued by the coordinator once the handler returned
    #[serde(default)]
    pub follow_ups: Vec<WorkPayload>,
}

impl WorkOutput {
    pub fn new(result: WorkResult) -> Self {
        Self {
            result,
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_up(mut self, payload: WorkPayload) -> Self {
        self.follow_ups.push(payload);
        self
    }
}

/// One unit of schedulable, retryable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub payload: WorkPayload,
    pub state: WorkState,

    /// Executions that have ended so far (success, failure or lease expiry)
    pub attempts: u32,
    pub max_attempts: u32,

    pub result: Option<WorkResult>,
    pub error: Option<TaskError>,

    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(payload: WorkPayload, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            state: WorkState::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            result: None,
            error: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> WorkKind {
        self.payload.kind()
    }

}
