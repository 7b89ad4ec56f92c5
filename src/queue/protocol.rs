use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawler::task::TaskError;
use crate::queue::item::{WorkItem, WorkKind, WorkOutput};

/// Route prefix of the work queue protocol
pub const API_PREFIX: &str = "/api/work_queue";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,

    /// Kinds the worker can execute; empty means every kind
    #[serde(default)]
    pub kinds: Vec<WorkKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub item: WorkItem,
    pub lease_token: Uuid,
    pub lease_expires_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub lease_token: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub lease_token: Uuid,
    pub output: WorkOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub lease_token: Uuid,

    /// The variant carries the retry hint
    pub error: TaskError,
}

/// Status word of heartbeat/finish/fail answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Duplicate,
    Expired,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: AckStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_in_ms: Option<u64>,
}

impl AckResponse {
    pub fn new(status: AckStatus) -> Self {
        Self {
            status,
            lease_expires_in_ms: None,
        }
    }
}
