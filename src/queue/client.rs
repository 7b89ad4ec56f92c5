use rand::Rng;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::QueueSettings;
use crate::crawler::task::TaskError;
use crate::queue::coordinator::HandlerRegistry;
use crate::queue::item::{WorkKind, WorkOutput, WorkPayload};
use crate::queue::protocol::{
    AckResponse, AckStatus, ClaimRequest, ClaimResponse, FailRequest, FinishRequest, HeartbeatRequest, API_PREFIX,
};
use crate::queue::state::{QueueError, QueueSnapshot};

/// HTTP client of the work queue protocol
#[derive(Clone)]
pub struct QueueClient {
    client: Client,
    base_url: String,
}

impl QueueClient {
    /// `poll_timeout` is the server's long-poll window; requests are allowed
    /// to outlive it
    pub fn new(base_url: &str, poll_timeout: Duration) -> Result<Self, QueueError> {
        let client = Client::builder()
            .timeout(poll_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| QueueError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}{}", base_url.trim_end_matches('/'), API_PREFIX),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Ask for the next item; `None` when the server had nothing to hand out
    pub async fn claim(&self, worker_id: &str, kinds: &[WorkKind]) -> Result<Option<ClaimResponse>, QueueError> {
        let request = ClaimRequest {
            worker_id: worker_id.to_string(),
            kinds: kinds.to_vec(),
        };

        let response = self
            .client
            .post(self.endpoint("claim"))
            .json(&request)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let claim = response
                    .json::<ClaimResponse>()
                    .await
                    .map_err(|e| QueueError::Malformed(format!("claim response: {}", e)))?;
                Ok(Some(claim))
            }
            other => Err(QueueError::Transport(format!("claim answered {}", other))),
        }
    }

    /// Renew a lease; `false` once the server no longer knows it
    pub async fn heartbeat(&self, lease_token: Uuid) -> Result<bool, QueueError> {
        let status = self
            .post_ack("heartbeat", &HeartbeatRequest { lease_token })
            .await?;
        Ok(status == AckStatus::Ok)
    }

    pub async fn finish(&self, lease_token: Uuid, output: WorkOutput) -> Result<AckStatus, QueueError> {
        self.post_ack("finish", &FinishRequest { lease_token, output }).await
    }

    pub async fn fail(&self, lease_token: Uuid, error: TaskError) -> Result<AckStatus, QueueError> {
        self.post_ack("fail", &FailRequest { lease_token, error }).await
    }

    pub async fn status(&self) -> Result<QueueSnapshot, QueueError> {
        self.client
            .get(self.endpoint("status"))
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?
            .json::<QueueSnapshot>()
            .await
            .map_err(|e| QueueError::Malformed(format!("status response: {}", e)))
    }

    async fn post_ack<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<AckStatus, QueueError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CONFLICT => {
                let ack = response
                    .json::<AckResponse>()
                    .await
                    .map_err(|e| QueueError::Malformed(format!("{} response: {}", path, e)))?;
                Ok(ack.status)
            }
            other => Err(QueueError::Transport(format!("{} answered {}", path, other))),
        }
    }
}

/// Jittered exponential backoff: `min * 2^failures` capped at `max`, then
/// drawn uniformly from its upper half
pub fn backoff_delay(failures: u32, min: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    let ceiling = min.saturating_mul(factor).min(max).max(min);
    let floor = ceiling / 2;
    if ceiling <= floor {
        return ceiling;
    }
    rand::thread_rng().gen_range(floor..=ceiling)
}

/// Worker process: claims items from a remote queue and runs them with local
/// handlers
pub struct RemoteWorker {
    client: QueueClient,
    registry: HandlerRegistry,
    worker_id: String,
    kinds: Vec<WorkKind>,
    heartbeat_interval: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl RemoteWorker {
    pub fn new(client: QueueClient, registry: HandlerRegistry, worker_id: String, settings: &QueueSettings) -> Self {
        let kinds = registry.kinds();
        Self {
            client,
            registry,
            worker_id,
            kinds,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms.max(1)),
            min_backoff: Duration::from_millis(settings.min_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and execute items until the task is dropped
    pub async fn run(&self) {
        info!("Worker {} polling for {:?}", self.worker_id, self.kinds);
        let mut misses: u32 = 0;

        loop {
            match self.run_once().await {
                Ok(true) => misses = 0,
                Ok(false) => {
                    let delay = backoff_delay(misses, self.min_backoff, self.max_backoff);
                    debug!("No work available, backing off for {:?}", delay);
                    misses = misses.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let delay = backoff_delay(misses, self.min_backoff, self.max_backoff);
                    warn!("Work queue unreachable ({}), retrying in {:?}", e, delay);
                    misses = misses.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Claim at most one item and report its outcome; returns whether an item
    /// was executed
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(claim) = self.client.claim(&self.worker_id, &self.kinds).await? else {
            return Ok(false);
        };

        let token = claim.lease_token;
        let item = claim.item;
        info!(
            "Worker {} leased {} item {} (attempt {}/{}): {}",
            self.worker_id,
            item.kind(),
            item.id,
            item.attempts + 1,
            item.max_attempts,
            item.payload.label()
        );

        let heartbeat = self.spawn_heartbeat(token);
        let outcome = self.execute(&item.payload).await;
        heartbeat.abort();

        let ack = match outcome {
            Ok(output) => self.report(token, Report::Finish(output)).await,
            Err(e) => {
                warn!("{} item {} failed: {}", item.kind(), item.id, e);
                self.report(token, Report::Fail(e)).await
            }
        };

        match ack {
            Ok(AckStatus::Ok) | Ok(AckStatus::Duplicate) => debug!("Settled item {}", item.id),
            Ok(status) => {
                // Lease lost to the reclaim sweep; the item belongs to someone else now
                warn!("Result for item {} discarded by the queue ({:?})", item.id, status);
            }
            Err(e) => error!("Could not report item {}: {}", item.id, e),
        }

        Ok(true)
    }

    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutput, TaskError> {
        let kind = payload.kind();
        let Some(handler) = self.registry.handler(kind) else {
            return Err(TaskError::Terminal(format!("worker has no handler for {}", kind)));
        };

        let handler = handler.clone();
        let payload = payload.clone();
        match tokio::spawn(async move { handler.execute(&payload).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(TaskError::Terminal(format!("handler panicked: {}", e))),
        }
    }

    fn spawn_heartbeat(&self, token: Uuid) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let interval = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match client.heartbeat(token).await {
                    Ok(true) => debug!("Renewed lease {}", token),
                    Ok(false) => {
                        warn!("Lease {} expired while the item was running", token);
                        break;
                    }
                    Err(e) => warn!("Heartbeat for lease {} failed: {}", token, e),
                }
            }
        })
    }

    /// Deliver a result, retrying transport errors; a repeated delivery is a
    /// no-op on the server
    async fn report(&self, token: Uuid, report: Report) -> Result<AckStatus, QueueError> {
        let mut failures = 0;
        loop {
            let sent = match &report {
                Report::Finish(output) => self.client.finish(token, output.clone()).await,
                Report::Fail(error) => self.client.fail(token, error.clone()).await,
            };

            match sent {
                Err(QueueError::Transport(e)) if failures < 3 => {
                    let delay = backoff_delay(failures, self.min_backoff, self.max_backoff);
                    warn!("Reporting lease {} failed ({}), retrying in {:?}", token, e, delay);
                    failures += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

enum Report {
    Finish(WorkOutput),
    Fail(TaskError),
}

/// Default worker id: host name plus a random suffix
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, &Uuid::new_v4().simple().to_string()[..8])
}
