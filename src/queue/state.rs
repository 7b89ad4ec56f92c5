use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::crawler::task::TaskError;
use crate::queue::item::{WorkItem, WorkKind, WorkOutput, WorkState};

/// Errors of the queue protocol; all of them are expected under concurrency
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("unknown lease token {0}")]
    UnknownLease(Uuid),

    #[error("lease {0} has expired")]
    LeaseExpired(Uuid),

    #[error("work item {0} is not active")]
    NotActive(Uuid),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("queue transport error: {0}")]
    Transport(String),
}

/// Who holds an active item
#[derive(Debug, Clone)]
pub enum Owner {
    /// In-process worker slot
    Local { slot: usize },

    /// Remote worker process holding a time-bounded lease
    Lease { worker_id: String, duration: Duration },
}

/// Server-side record of an outstanding remote claim
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub token: Uuid,
    pub worker_id: String,
    pub item_id: Uuid,
    pub duration: Duration,
    pub expires_at: Instant,
}

/// Outcome of a claim attempt
#[derive(Debug)]
pub enum Claim {
    Ready {
        item: WorkItem,
        lease: Option<LeaseRecord>,
    },

    /// Nothing claimable now; a backed-off item becomes available at this instant
    Deferred(Instant),

    Empty,
}

/// Transition applied when an execution ends
#[derive(Debug, Clone)]
pub enum Settlement {
    Done(WorkItem),
    Requeued(WorkItem),
    Failed(WorkItem),
}

impl Settlement {
    pub fn item(&self) -> &WorkItem {
        match self {
            Settlement::Done(item) | Settlement::Requeued(item) | Settlement::Failed(item) => item,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Settlement::Requeued(_))
    }
}

/// Result of a finish/fail presented with a lease token
#[derive(Debug, Clone)]
pub enum LeaseAck {
    Applied(Settlement),

    /// The token was already settled; nothing changed
    Duplicate,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
    pub leases: usize,
}

struct Pending {
    item: WorkItem,
    available_at: Instant,
}

struct ActiveItem {
    item: WorkItem,
    owner: Owner,
}

/// Input queue, active set and lease table, with the Done/retry/Failed
/// transitions shared by local workers and remote leaseholders
pub struct WorkQueue {
    pending: VecDeque<Pending>,
    active: HashMap<Uuid, ActiveItem>,
    leases: HashMap<Uuid, LeaseRecord>,

    /// Tokens whose finish/fail was already applied, kept until the instant
    /// a repeated report can no longer arrive (one lease duration later)
    settled_leases: HashMap<Uuid, Instant>,

    priorities: HashMap<WorkKind, i32>,
    retry_backoff: Duration,
    max_attempts: u32,

    done: usize,
    failed: usize,
}

impl WorkQueue {
    pub fn new(max_attempts: u32, retry_backoff: Duration, priorities: HashMap<WorkKind, i32>) -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            leases: HashMap::new(),
            settled_leases: HashMap::new(),
            priorities,
            retry_backoff,
            max_attempts: max_attempts.max(1),
            done: 0,
            failed: 0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Append an item at the tail, claimable immediately
    pub fn push(&mut self, mut item: WorkItem, now: Instant) {
        item.state = WorkState::Queued;
        self.pending.push_back(Pending {
            item,
            available_at: now,
        });
    }

    /// Hand the next claimable item of one of `kinds` to `owner`
    pub fn claim(&mut self, kinds: &[WorkKind], owner: Owner, now: Instant) -> Claim {
        let index = match self.next_index(kinds, now) {
            Ok(index) => index,
            Err(Some(at)) => return Claim::Deferred(at),
            Err(None) => return Claim::Empty,
        };
        let Some(Pending { mut item, .. }) = self.pending.remove(index) else {
            return Claim::Empty;
        };

        item.state = WorkState::Active;

        let lease = match &owner {
            Owner::Local { .. } => None,
            Owner::Lease {
                worker_id,
                duration,
            } => {
                let record = LeaseRecord {
                    token: Uuid::new_v4(),
                    worker_id: worker_id.clone(),
                    item_id: item.id,
                    duration: *duration,
                    expires_at: now + *duration,
                };
                self.leases.insert(record.token, record.clone());
                Some(record)
            }
        };

        self.active.insert(
            item.id,
            ActiveItem {
                item: item.clone(),
                owner,
            },
        );

        Claim::Ready { item, lease }
    }

    /// Highest priority first, FIFO within a priority. On a miss, reports
    /// when the earliest backed-off item of the requested kinds matures.
    fn next_index(&self, kinds: &[WorkKind], now: Instant) -> Result<usize, Option<Instant>> {
        let mut best: Option<(usize, i32)> = None;
        let mut next_at: Option<Instant> = None;

        for (index, pending) in self.pending.iter().enumerate() {
            let kind = pending.item.kind();
            if !kinds.contains(&kind) {
                continue;
            }
            if pending.available_at > now {
                next_at = Some(next_at.map_or(pending.available_at, |at| at.min(pending.available_at)));
                continue;
            }
            let priority = self.priorities.get(&kind).copied().unwrap_or(0);
            if best.map_or(true, |(_, best_priority)| priority > best_priority) {
                best = Some((index, priority));
            }
        }

        best.map(|(index, _)| index).ok_or(next_at)
    }

    /// Mark an active item Done and enqueue its follow-ups
    pub fn complete(&mut self, item_id: Uuid, output: WorkOutput, now: Instant) -> Result<Settlement, QueueError> {
        let ActiveItem { mut item, .. } = self
            .active
            .remove(&item_id)
            .ok_or(QueueError::NotActive(item_id))?;

        item.attempts += 1;
        item.state = WorkState::Done;
        item.result = Some(output.result);
        item.error = None;

        for payload in output.follow_ups {
            let follow_up = WorkItem::new(payload, self.max_attempts);
            self.push(follow_up, now);
        }

        self.done += 1;
        Ok(Settlement::Done(item))
    }

    /// Record a failed execution: requeue after the backoff when the error is
    /// retryable and attempts remain, fail the item otherwise
    pub fn fail(&mut self, item_id: Uuid, error: TaskError, now: Instant) -> Result<Settlement, QueueError> {
        let ActiveItem { mut item, .. } = self
            .active
            .remove(&item_id)
            .ok_or(QueueError::NotActive(item_id))?;

        item.attempts += 1;
        let retry = error.is_retryable() && item.attempts < item.max_attempts;
        item.error = Some(error);

        if retry {
            item.state = WorkState::Queued;
            self.pending.push_back(Pending {
                item: item.clone(),
                available_at: now + self.retry_backoff,
            });
            Ok(Settlement::Requeued(item))
        } else {
            item.state = WorkState::Failed;
            self.failed += 1;
            Ok(Settlement::Failed(item))
        }
    }

    fn live_lease(&self, token: Uuid, now: Instant) -> Result<&LeaseRecord, QueueError> {
        let lease = self.leases.get(&token).ok_or(QueueError::UnknownLease(token))?;
        if lease.expires_at <= now {
            return Err(QueueError::LeaseExpired(token));
        }
        Ok(lease)
    }

    /// Extend a live lease by its duration and return the new expiry
    pub fn heartbeat(&mut self, token: Uuid, now: Instant) -> Result<Instant, QueueError> {
        self.live_lease(token, now)?;
        let lease = self
            .leases
            .get_mut(&token)
            .ok_or(QueueError::UnknownLease(token))?;
        lease.expires_at = now + lease.duration;
        Ok(lease.expires_at)
    }

    /// Retire a live lease, remembering its token for duplicate reports
    fn settle_lease(&mut self, token: Uuid, now: Instant) -> Result<Uuid, QueueError> {
        self.live_lease(token, now)?;
        let lease = self.leases.remove(&token).ok_or(QueueError::UnknownLease(token))?;
        self.settled_leases.insert(token, now + lease.duration);
        Ok(lease.item_id)
    }

    pub fn finish_lease(&mut self, token: Uuid, output: WorkOutput, now: Instant) -> Result<LeaseAck, QueueError> {
        if self.settled_leases.contains_key(&token) {
            return Ok(LeaseAck::Duplicate);
        }
        let item_id = self.settle_lease(token, now)?;
        Ok(LeaseAck::Applied(self.complete(item_id, output, now)?))
    }

    pub fn fail_lease(&mut self, token: Uuid, error: TaskError, now: Instant) -> Result<LeaseAck, QueueError> {
        if self.settled_leases.contains_key(&token) {
            return Ok(LeaseAck::Duplicate);
        }
        let item_id = self.settle_lease(token, now)?;
        Ok(LeaseAck::Applied(self.fail(item_id, error, now)?))
    }

    /// Drop every lease past its expiry and put its item back in line; the
    /// lost execution counts as a consumed attempt
    pub fn reclaim_expired(&mut self, now: Instant) -> Vec<Settlement> {
        self.settled_leases.retain(|_, keep_until| *keep_until > now);

        let expired: Vec<Uuid> = self
            .leases
            .values()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.token)
            .collect();

        let mut settled = Vec::with_capacity(expired.len());
        for token in expired {
            if let Some(lease) = self.leases.remove(&token) {
                let error = TaskError::Retryable(format!("lease held by {} expired", lease.worker_id));
                if let Ok(settlement) = self.fail(lease.item_id, error, now) {
                    settled.push(settlement);
                }
            }
        }
        settled
    }

    /// Local slot or leaseholder currently executing an item
    pub fn owner_of(&self, item_id: Uuid) -> Option<&Owner> {
        self.active.get(&item_id).map(|active| &active.owner)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.pending.len(),
            active: self.active.len(),
            done: self.done,
            failed: self.failed,
            leases: self.leases.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{CaptureOutcome, CaptureRequest};
    use crate::queue::item::{WorkPayload, WorkResult};
    use chrono::Utc;
    use std::path::PathBuf;

    fn capture(url: &str) -> WorkPayload {
        WorkPayload::Capture(CaptureRequest {
            url: url.to_string(),
            output_dir: PathBuf::from("out"),
            reference_dir: None,
        })
    }

    fn diff(path: &str) -> WorkPayload {
        WorkPayload::Diff(crate::crawler::task::DiffRequest {
            name: path.replace('/', "_"),
            url_path: path.to_string(),
            run_dir: PathBuf::from("out"),
            reference_dir: PathBuf::from("ref"),
        })
    }

    fn output(url: &str) -> WorkOutput {
        WorkOutput::new(WorkResult::Captured(CaptureOutcome {
            url: url.to_string(),
            status_code: 200,
            content_type: "text/html".to_string(),
            final_url: url.to_string(),
            links: vec![],
            screenshot: PathBuf::from("out/__run.png"),
            captured_at: Utc::now(),
        }))
    }

    fn local() -> Owner {
        Owner::Local { slot: 0 }
    }

    fn remote(duration: Duration) -> Owner {
        Owner::Lease {
            worker_id: "worker-1".to_string(),
            duration,
        }
    }

    fn queue(max_attempts: u32) -> WorkQueue {
        WorkQueue::new(max_attempts, Duration::ZERO, HashMap::new())
    }

    fn claim_id(queue: &mut WorkQueue, now: Instant) -> Uuid {
        match queue.claim(&WorkKind::ALL, local(), now) {
            Claim::Ready { item, .. } => item.id,
            other => panic!("expected an item, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_across_kinds() {
        let now = Instant::now();
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);
        q.push(WorkItem::new(diff("/b"), 3), now);
        q.push(WorkItem::new(capture("http://c/"), 3), now);

        let mut labels = Vec::new();
        while let Claim::Ready { item, .. } = q.claim(&WorkKind::ALL, local(), now) {
            labels.push(item.payload.label().to_string());
        }
        assert_eq!(labels, vec!["http://a/", "/b", "http://c/"]);
    }

    #[test]
    fn test_kind_priority_and_filter() {
        let now = Instant::now();
        let mut priorities = HashMap::new();
        priorities.insert(WorkKind::Diff, 10);
        let mut q = WorkQueue::new(3, Duration::ZERO, priorities);
        q.push(WorkItem::new(capture("http://a/"), 3), now);
        q.push(WorkItem::new(diff("/b"), 3), now);

        match q.claim(&[WorkKind::Capture], local(), now) {
            Claim::Ready { item, .. } => assert_eq!(item.kind(), WorkKind::Capture),
            other => panic!("unexpected {:?}", other),
        }
        q.push(WorkItem::new(capture("http://c/"), 3), now);
        match q.claim(&WorkKind::ALL, local(), now) {
            Claim::Ready { item, .. } => assert_eq!(item.kind(), WorkKind::Diff),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_success_after_one_retry_consumes_two_attempts() {
        let now = Instant::now();
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let id = claim_id(&mut q, now);
        let settled = q.fail(id, TaskError::Retryable("timeout".into()), now).unwrap();
        assert!(matches!(settled, Settlement::Requeued(_)));
        assert_eq!(settled.item().state, WorkState::Queued);

        let id = claim_id(&mut q, now);
        let settled = q.complete(id, output("http://a/"), now).unwrap();
        let item = settled.item();
        assert_eq!(item.state, WorkState::Done);
        assert_eq!(item.attempts, 2);
        assert!(q.is_idle());
    }

    #[test]
    fn test_failure_after_exhausting_attempts() {
        let now = Instant::now();
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let mut last = None;
        for _ in 0..3 {
            let id = claim_id(&mut q, now);
            last = Some(q.fail(id, TaskError::Retryable("boom".into()), now).unwrap());
        }

        let settled = last.unwrap();
        assert!(matches!(settled, Settlement::Failed(_)));
        assert_eq!(settled.item().attempts, 3);
        assert!(matches!(q.claim(&WorkKind::ALL, local(), now), Claim::Empty));
        assert_eq!(q.snapshot().failed, 1);
    }

    #[test]
    fn test_terminal_error_fails_immediately() {
        let now = Instant::now();
        let mut q = queue(5);
        q.push(WorkItem::new(capture("http://a/"), 5), now);

        let id = claim_id(&mut q, now);
        let settled = q.fail(id, TaskError::Terminal("HTTP 404".into()), now).unwrap();
        assert!(matches!(settled, Settlement::Failed(_)));
        assert_eq!(settled.item().attempts, 1);
        assert!(q.is_idle());
    }

    #[test]
    fn test_backoff_defers_retry() {
        let now = Instant::now();
        let backoff = Duration::from_secs(2);
        let mut q = WorkQueue::new(3, backoff, HashMap::new());
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let id = claim_id(&mut q, now);
        q.fail(id, TaskError::Retryable("busy".into()), now).unwrap();

        match q.claim(&WorkKind::ALL, local(), now) {
            Claim::Deferred(at) => assert_eq!(at, now + backoff),
            other => panic!("expected deferral, got {:?}", other),
        }
        assert!(!q.is_idle());
        claim_id(&mut q, now + backoff);
    }

    #[test]
    fn test_follow_ups_are_enqueued() {
        let now = Instant::now();
        let mut q = queue(2);
        q.push(WorkItem::new(capture("http://a/"), 2), now);

        let id = claim_id(&mut q, now);
        q.complete(id, output("http://a/").with_follow_up(diff("/")), now).unwrap();

        match q.claim(&WorkKind::ALL, local(), now) {
            Claim::Ready { item, .. } => {
                assert_eq!(item.kind(), WorkKind::Diff);
                assert_eq!(item.max_attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expired_lease_requeues_once_and_rejects_late_finish() {
        let now = Instant::now();
        let lease_for = Duration::from_secs(30);
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let lease = match q.claim(&WorkKind::ALL, remote(lease_for), now) {
            Claim::Ready { lease: Some(lease), .. } => lease,
            other => panic!("expected a lease, got {:?}", other),
        };
        assert!(matches!(q.owner_of(lease.item_id), Some(Owner::Lease { .. })));
        assert_eq!(q.snapshot().leases, 1);

        let later = now + lease_for + Duration::from_millis(1);
        let settled = q.reclaim_expired(later);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].item().state, WorkState::Queued);
        assert_eq!(settled[0].item().attempts, 1);

        // A second sweep finds nothing left to reclaim
        assert!(q.reclaim_expired(later).is_empty());
        assert_eq!(q.snapshot().queued, 1);

        assert_eq!(
            q.finish_lease(lease.token, output("http://a/"), later).unwrap_err(),
            QueueError::UnknownLease(lease.token)
        );

        // The item can be leased again by someone else
        match q.claim(&WorkKind::ALL, remote(lease_for), later) {
            Claim::Ready { item, lease: Some(second) } => {
                assert_eq!(item.id, lease.item_id);
                assert_ne!(second.token, lease.token);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_and_duplicate_finish() {
        let now = Instant::now();
        let lease_for = Duration::from_secs(10);
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let lease = match q.claim(&WorkKind::ALL, remote(lease_for), now) {
            Claim::Ready { lease: Some(lease), .. } => lease,
            other => panic!("expected a lease, got {:?}", other),
        };

        // Renewing before expiry keeps the item out of the sweep
        let renewed_at = now + Duration::from_secs(8);
        let expiry = q.heartbeat(lease.token, renewed_at).unwrap();
        assert_eq!(expiry, renewed_at + lease_for);
        assert!(q.reclaim_expired(now + Duration::from_secs(12)).is_empty());

        let finish_at = now + Duration::from_secs(15);
        assert!(matches!(
            q.finish_lease(lease.token, output("http://a/"), finish_at),
            Ok(LeaseAck::Applied(Settlement::Done(_)))
        ));
        assert!(matches!(
            q.finish_lease(lease.token, output("http://a/"), finish_at),
            Ok(LeaseAck::Duplicate)
        ));
        assert_eq!(q.snapshot().done, 1);

        let stranger = Uuid::new_v4();
        assert_eq!(
            q.heartbeat(stranger, finish_at),
            Err(QueueError::UnknownLease(stranger))
        );
    }

    #[test]
    fn test_settled_tokens_are_forgotten_after_a_lease_duration() {
        let now = Instant::now();
        let lease_for = Duration::from_secs(10);
        let mut q = queue(3);
        q.push(WorkItem::new(capture("http://a/"), 3), now);

        let lease = match q.claim(&WorkKind::ALL, remote(lease_for), now) {
            Claim::Ready { lease: Some(lease), .. } => lease,
            other => panic!("expected a lease, got {:?}", other),
        };
        let failed_at = now + Duration::from_secs(1);
        assert!(q.fail_lease(lease.token, TaskError::Terminal("broken".into()), failed_at).is_ok());

        // A resent report inside the window is still recognized
        q.reclaim_expired(failed_at + Duration::from_secs(5));
        assert!(matches!(
            q.fail_lease(lease.token, TaskError::Terminal("broken".into()), failed_at + Duration::from_secs(5)),
            Ok(LeaseAck::Duplicate)
        ));

        q.reclaim_expired(failed_at + lease_for);
        assert!(q.settled_leases.is_empty());
        assert!(matches!(
            q.fail_lease(lease.token, TaskError::Terminal("broken".into()), failed_at + lease_for),
            Err(QueueError::UnknownLease(token)) if token == lease.token
        ));
        assert_eq!(q.snapshot().failed, 1);
    }
}
