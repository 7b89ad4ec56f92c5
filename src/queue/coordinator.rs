use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::CoordinatorSettings;
use crate::crawler::task::TaskError;
use crate::queue::item::{WorkItem, WorkKind, WorkOutput, WorkPayload};
use crate::queue::state::{Claim, LeaseAck, LeaseRecord, Owner, QueueError, QueueSnapshot, Settlement, WorkQueue};

/// Executes one kind of work item. Implementations may block on I/O or
/// subprocesses; they only touch their own payload and artifact paths.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutput, TaskError>;
}

/// Handler table, filled once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    capture: Option<Arc<dyn WorkHandler>>,
    diff: Option<Arc<dyn WorkHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a kind with its handler, replacing any earlier registration
    pub fn register(&mut self, kind: WorkKind, handler: Arc<dyn WorkHandler>) -> &mut Self {
        match kind {
            WorkKind::Capture => self.capture = Some(handler),
            WorkKind::Diff => self.diff = Some(handler),
        }
        self
    }

    pub fn handler(&self, kind: WorkKind) -> Option<&Arc<dyn WorkHandler>> {
        match kind {
            WorkKind::Capture => self.capture.as_ref(),
            WorkKind::Diff => self.diff.as_ref(),
        }
    }

    /// Kinds with a registered handler
    pub fn kinds(&self) -> Vec<WorkKind> {
        WorkKind::ALL
            .into_iter()
            .filter(|kind| self.handler(*kind).is_some())
            .collect()
    }
}

/// Receiving end of the output queue: every item that reached Done or Failed
pub struct Completions {
    rx: mpsc::UnboundedReceiver<WorkItem>,
}

impl Completions {
    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }
}

struct Shared {
    queue: Mutex<WorkQueue>,
    registry: HandlerRegistry,
    settings: CoordinatorSettings,

    /// Signalled whenever new work may be claimable
    work_ready: Notify,

    /// Signalled whenever the queue drains
    idle: Notify,

    completions_tx: mpsc::UnboundedSender<WorkItem>,
    completions_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,

    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Scheduler owning the work queue and the local worker pool. Cloning yields
/// another handle to the same coordinator.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Build a coordinator and spawn its local workers on the current runtime.
    /// Workers only claim kinds present in `registry`.
    pub fn start(settings: CoordinatorSettings, registry: HandlerRegistry) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new(
            settings.max_attempts,
            Duration::from_millis(settings.retry_backoff_ms),
            settings.priorities.clone(),
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(queue),
            registry,
            settings,
            work_ready: Notify::new(),
            idle: Notify::new(),
            completions_tx,
            completions_rx: std::sync::Mutex::new(Some(completions_rx)),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let kinds = shared.registry.kinds();
        let worker_count = if kinds.is_empty() { 0 } else { shared.settings.workers };
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|slot| {
                let shared = shared.clone();
                let kinds = kinds.clone();
                tokio::spawn(async move { worker_loop(shared, slot, kinds).await })
            })
            .collect();

        info!("Coordinator started with {} local workers for {:?}", worker_count, kinds);

        // Nobody else can hold the lock yet
        if let Ok(mut workers) = shared.workers.try_lock() {
            workers.extend(handles);
        }

        Self { shared }
    }

    /// Take the output queue. Only the first caller gets it, so a single run
    /// drives a coordinator.
    pub fn take_completions(&self) -> Option<Completions> {
        let mut slot = self
            .shared
            .completions_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take().map(|rx| Completions { rx })
    }

    /// Build a queued item for `payload` with the configured attempt limit
    pub fn new_item(&self, payload: WorkPayload) -> WorkItem {
        WorkItem::new(payload, self.shared.settings.max_attempts)
    }

    /// Append a queued item at the tail of the input queue
    pub async fn enqueue(&self, item: WorkItem) -> Uuid {
        let id = item.id;
        debug!("Enqueued {} item {}: {}", item.kind(), id, item.payload.label());
        self.shared.queue.lock().await.push(item, Instant::now());
        self.shared.work_ready.notify_waiters();
        id
    }

    /// Shorthand for `enqueue(new_item(payload))`
    pub async fn submit(&self, payload: WorkPayload) -> Uuid {
        let item = self.new_item(payload);
        self.enqueue(item).await
    }

    /// Resolve once nothing is queued or active
    pub async fn wait_all(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.queue.lock().await.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.shared.queue.lock().await.snapshot()
    }

    /// Stop the local workers once their in-flight items settle
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.work_ready.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.shared.workers.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        debug!("Coordinator shut down");
    }

    /// Lease the next item of `kinds` to a remote worker, waiting up to
    /// `wait` for one to become available
    pub async fn claim_lease(
        &self,
        worker_id: &str,
        kinds: &[WorkKind],
        lease: Duration,
        wait: Duration,
    ) -> Option<(WorkItem, LeaseRecord)> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.shared.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let owner = Owner::Lease {
                worker_id: worker_id.to_string(),
                duration: lease,
            };
            let wake_at = match self.shared.queue.lock().await.claim(kinds, owner, Instant::now()) {
                Claim::Ready {
                    item,
                    lease: Some(record),
                } => {
                    debug!("Leased item {} to {}", item.id, worker_id);
                    return Some((item, record));
                }
                Claim::Ready { item, lease: None } => {
                    error!("Remote claim of {} produced no lease", item.id);
                    return None;
                }
                Claim::Deferred(at) => at.min(deadline),
                Claim::Empty => deadline,
            };

            if Instant::now() >= deadline || self.shared.shutdown.load(Ordering::SeqCst) {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Renew a lease; returns the time left on it
    pub async fn heartbeat(&self, token: Uuid) -> Result<Duration, QueueError> {
        let now = Instant::now();
        let expires_at = self.shared.queue.lock().await.heartbeat(token, now)?;
        Ok(expires_at.saturating_duration_since(now))
    }

    pub async fn finish_lease(&self, token: Uuid, output: WorkOutput) -> Result<LeaseAck, QueueError> {
        let mut queue = self.shared.queue.lock().await;
        let ack = queue.finish_lease(token, output, Instant::now())?;
        if let LeaseAck::Applied(settlement) = &ack {
            self.shared.publish(&queue, settlement);
        }
        Ok(ack)
    }

    pub async fn fail_lease(&self, token: Uuid, error: TaskError) -> Result<LeaseAck, QueueError> {
        let mut queue = self.shared.queue.lock().await;
        let ack = queue.fail_lease(token, error, Instant::now())?;
        if let LeaseAck::Applied(settlement) = &ack {
            self.shared.publish(&queue, settlement);
        }
        Ok(ack)
    }

    /// Return the items of expired leases to the queue; returns how many
    pub async fn reclaim_expired(&self) -> usize {
        let mut queue = self.shared.queue.lock().await;
        let settled = queue.reclaim_expired(Instant::now());
        for settlement in &settled {
            warn!(
                "Reclaimed {} item {} after lease expiry (attempt {}/{})",
                settlement.item().kind(),
                settlement.item().id,
                settlement.item().attempts,
                settlement.item().max_attempts
            );
            self.shared.publish(&queue, settlement);
        }
        settled.len()
    }
}

impl Shared {
    /// Announce a settled execution. Runs under the queue lock so a
    /// completion is always on the output queue before `wait_all` can see the
    /// queue idle.
    fn publish(&self, queue: &WorkQueue, settlement: &Settlement) {
        let item = settlement.item();
        match settlement {
            Settlement::Done(_) => {
                debug!("{} item {} done after {} attempt(s)", item.kind(), item.id, item.attempts);
            }
            Settlement::Requeued(_) => {
                warn!(
                    "{} item {} failed (attempt {}/{}), requeued: {}",
                    item.kind(),
                    item.id,
                    item.attempts,
                    item.max_attempts,
                    item.error.as_ref().map(ToString::to_string).unwrap_or_default()
                );
            }
            Settlement::Failed(_) => {
                warn!(
                    "{} item {} failed after {} attempt(s): {}",
                    item.kind(),
                    item.id,
                    item.attempts,
                    item.error.as_ref().map(ToString::to_string).unwrap_or_default()
                );
            }
        }

        if settlement.is_terminal() && self.completions_tx.send(item.clone()).is_err() {
            debug!("Output queue closed, dropping completion of {}", item.id);
        }

        // Requeues and follow-ups may have made work claimable
        self.work_ready.notify_waiters();

        if queue.is_idle() {
            self.idle.notify_waiters();
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, slot: usize, kinds: Vec<WorkKind>) {
    debug!("Worker {} started", slot);

    loop {
        let notified = shared.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let claim = shared
            .queue
            .lock()
            .await
            .claim(&kinds, Owner::Local { slot }, Instant::now());

        match claim {
            Claim::Ready { item, .. } => execute(&shared, slot, item).await,
            Claim::Deferred(at) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            Claim::Empty => notified.await,
        }
    }

    debug!("Worker {} stopped", slot);
}

async fn execute(shared: &Shared, slot: usize, item: WorkItem) {
    let kind = item.kind();
    debug!(
        "Worker {} executing {} item {} (attempt {}/{}): {}",
        slot,
        kind,
        item.id,
        item.attempts + 1,
        item.max_attempts,
        item.payload.label()
    );

    let outcome = match shared.registry.handler(kind) {
        Some(handler) => {
            let handler = handler.clone();
            let payload = item.payload.clone();
            // A panicking handler must not leave the item active forever
            match tokio::spawn(async move { handler.execute(&payload).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskError::Terminal(format!("handler panicked: {}", e))),
            }
        }
        None => Err(TaskError::Terminal(format!("no handler registered for {}", kind))),
    };

    let mut queue = shared.queue.lock().await;
    let now = Instant::now();
    let settled = match outcome {
        Ok(output) => queue.complete(item.id, output, now),
        Err(e) => queue.fail(item.id, e, now),
    };

    match settled {
        Ok(settlement) => shared.publish(&queue, &settlement),
        Err(e) => error!("Worker {} could not settle item {}: {}", slot, item.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{CaptureOutcome, CaptureRequest};
    use crate::queue::item::{WorkResult, WorkState};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` executions of every URL, then succeeds
    struct FlakyHandler {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
        follow_up: Option<WorkPayload>,
    }

    impl FlakyHandler {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicU32::new(0),
                follow_up: None,
            }
        }
    }

    #[async_trait]
    impl WorkHandler for FlakyHandler {
        async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutput, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if call < self.failures {
                return Err(if self.retryable {
                    TaskError::Retryable("flaky".into())
                } else {
                    TaskError::Terminal("broken".into())
                });
            }
            let mut output = WorkOutput::new(WorkResult::Captured(CaptureOutcome {
                url: payload.label().to_string(),
                status_code: 200,
                content_type: "text/html".to_string(),
                final_url: payload.label().to_string(),
                links: vec![],
                screenshot: PathBuf::from("shot.png"),
                captured_at: Utc::now(),
            }));
            if let Some(follow_up) = &self.follow_up {
                output = output.with_follow_up(follow_up.clone());
            }
            Ok(output)
        }
    }

    fn settings(workers: usize, max_attempts: u32) -> CoordinatorSettings {
        CoordinatorSettings {
            workers,
            max_attempts,
            retry_backoff_ms: 1,
            priorities: HashMap::new(),
        }
    }

    fn capture(url: &str) -> WorkPayload {
        WorkPayload::Capture(CaptureRequest {
            url: url.to_string(),
            output_dir: PathBuf::from("out"),
            reference_dir: None,
        })
    }

    fn coordinator_with(handler: Arc<FlakyHandler>, workers: usize, max_attempts: u32) -> Coordinator {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Capture, handler.clone());
        registry.register(WorkKind::Diff, handler);
        Coordinator::start(settings(workers, max_attempts), registry)
    }

    #[test]
    fn test_registry_dispatch_table() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.kinds().is_empty());
        registry.register(WorkKind::Diff, Arc::new(FlakyHandler::new(0, true)));
        assert_eq!(registry.kinds(), vec![WorkKind::Diff]);
        assert!(registry.handler(WorkKind::Capture).is_none());
    }

    #[tokio::test]
    async fn test_runs_all_items_in_parallel() {
        let handler = Arc::new(FlakyHandler::new(0, true));
        let coordinator = coordinator_with(handler.clone(), 4, 3);
        let mut completions = coordinator.take_completions().unwrap();
        assert!(coordinator.take_completions().is_none());

        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(coordinator.submit(capture(&format!("http://site/{}", i))).await);
        }
        coordinator.wait_all().await;

        let mut seen = Vec::new();
        while let Some(item) = completions.try_recv() {
            assert_eq!(item.state, WorkState::Done);
            seen.push(item.id);
        }
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
        assert_eq!(coordinator.snapshot().await.done, 10);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let handler = Arc::new(FlakyHandler::new(1, true));
        let coordinator = coordinator_with(handler.clone(), 2, 3);
        let mut completions = coordinator.take_completions().unwrap();

        let id = coordinator.submit(capture("http://site/")).await;
        coordinator.wait_all().await;

        let item = completions.try_recv().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.state, WorkState::Done);
        assert_eq!(item.attempts, 2);
        assert!(completions.try_recv().is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_after_retries() {
        let handler = Arc::new(FlakyHandler::new(u32::MAX, true));
        let coordinator = coordinator_with(handler.clone(), 2, 3);
        let mut completions = coordinator.take_completions().unwrap();

        coordinator.submit(capture("http://site/")).await;
        coordinator.wait_all().await;

        let item = completions.try_recv().unwrap();
        assert_eq!(item.state, WorkState::Failed);
        assert_eq!(item.attempts, 3);
        assert_eq!(item.error, Some(TaskError::Retryable("flaky".into())));

        // Nothing executes after the item failed
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let handler = Arc::new(FlakyHandler::new(1, false));
        let coordinator = coordinator_with(handler.clone(), 1, 5);
        let mut completions = coordinator.take_completions().unwrap();

        coordinator.submit(capture("http://site/")).await;
        coordinator.wait_all().await;

        let item = completions.try_recv().unwrap();
        assert_eq!(item.state, WorkState::Failed);
        assert_eq!(item.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_follow_ups_complete_before_idle() {
        let mut flaky = FlakyHandler::new(0, true);
        flaky.follow_up = Some(WorkPayload::Diff(crate::crawler::task::DiffRequest {
            name: "_".to_string(),
            url_path: "/".to_string(),
            run_dir: PathBuf::from("out"),
            reference_dir: PathBuf::from("ref"),
        }));
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Capture, Arc::new(flaky));
        registry.register(WorkKind::Diff, Arc::new(FlakyHandler::new(0, true)));
        let coordinator = Coordinator::start(settings(2, 2), registry);
        let mut completions = coordinator.take_completions().unwrap();

        coordinator.submit(capture("http://site/")).await;
        coordinator.wait_all().await;

        let mut kinds = Vec::new();
        while let Some(item) = completions.try_recv() {
            kinds.push(item.kind());
        }
        assert_eq!(kinds, vec![WorkKind::Capture, WorkKind::Diff]);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_all_on_empty_queue_returns() {
        let coordinator = coordinator_with(Arc::new(FlakyHandler::new(0, true)), 1, 1);
        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_all())
            .await
            .expect("idle coordinator should not block");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_lease_round_trip() {
        // No local workers: items wait for a leaseholder
        let coordinator = Coordinator::start(settings(0, 2), HandlerRegistry::new());
        let mut completions = coordinator.take_completions().unwrap();
        let id = coordinator.submit(capture("http://site/")).await;

        let (item, lease) = coordinator
            .claim_lease("w1", &[WorkKind::Capture], Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(item.id, id);
        assert!(coordinator.heartbeat(lease.token).await.unwrap() > Duration::from_secs(4));

        let nothing = coordinator
            .claim_lease("w2", &[WorkKind::Capture], Duration::from_secs(5), Duration::from_millis(20))
            .await;
        assert!(nothing.is_none());

        let output = WorkOutput::new(WorkResult::Captured(CaptureOutcome {
            url: "http://site/".to_string(),
            status_code: 200,
            content_type: "text/html".to_string(),
            final_url: "http://site/".to_string(),
            links: vec![],
            screenshot: PathBuf::from("shot.png"),
            captured_at: Utc::now(),
        }));
        assert!(matches!(
            coordinator.finish_lease(lease.token, output.clone()).await,
            Ok(LeaseAck::Applied(Settlement::Done(_)))
        ));
        assert!(matches!(
            coordinator.finish_lease(lease.token, output).await,
            Ok(LeaseAck::Duplicate)
        ));

        coordinator.wait_all().await;
        assert_eq!(completions.try_recv().map(|item| item.state), Some(WorkState::Done));
        assert!(completions.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let coordinator = Coordinator::start(settings(0, 2), HandlerRegistry::new());
        let poller = coordinator.clone();
        let claim = tokio::spawn(async move {
            poller
                .claim_lease("w1", &WorkKind::ALL, Duration::from_secs(5), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = coordinator.submit(capture("http://site/late")).await;

        let (item, _) = tokio::time::timeout(Duration::from_secs(2), claim)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.id, id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let coordinator = Coordinator::start(settings(0, 3), HandlerRegistry::new());
        let id = coordinator.submit(capture("http://site/")).await;

        let (_, lease) = coordinator
            .claim_lease("w1", &WorkKind::ALL, Duration::from_millis(10), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(coordinator.reclaim_expired().await, 1);
        assert_eq!(coordinator.reclaim_expired().await, 0);
        assert!(matches!(
            coordinator.fail_lease(lease.token, TaskError::Retryable("late".into())).await,
            Err(QueueError::UnknownLease(_))
        ));

        let (again, _) = coordinator
            .claim_lease("w2", &WorkKind::ALL, Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 1);
    }
}
