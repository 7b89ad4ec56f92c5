use anyhow::{Result, Context};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cli::config::QueueSettings;
use crate::queue::coordinator::Coordinator;
use crate::queue::item::WorkKind;
use crate::queue::protocol::{
    AckResponse, AckStatus, ClaimRequest, ClaimResponse, FailRequest, FinishRequest, HeartbeatRequest, API_PREFIX,
};
use crate::queue::state::LeaseAck;

/// Shared state of the queue protocol handlers
struct ServerState {
    coordinator: Coordinator,
    lease: Duration,
    poll_timeout: Duration,

    /// Flips to true when the server shuts down; pending claims give up
    closed: watch::Receiver<bool>,
}

/// Build the work queue router on top of `coordinator`
pub fn router(coordinator: Coordinator, settings: &QueueSettings, closed: watch::Receiver<bool>) -> Router {
    let state = Arc::new(ServerState {
        coordinator,
        lease: Duration::from_millis(settings.lease_ms),
        poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
        closed,
    });

    let api = Router::new()
        .route("/claim", post(claim_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/finish", post(finish_handler))
        .route("/fail", post(fail_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    Router::new().nest(API_PREFIX, api)
}

/// Running queue server plus its reclaim sweep
pub struct QueueServer {
    addr: SocketAddr,
    closed: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

impl QueueServer {
    /// Bind `settings.listen_addr` and serve the protocol until shut down
    pub async fn spawn(coordinator: Coordinator, settings: &QueueSettings) -> Result<Self> {
        let listener = TcpListener::bind(&settings.listen_addr)
            .await
            .context(format!("Failed to bind work queue server on {}", settings.listen_addr))?;
        let addr = listener
            .local_addr()
            .context("Failed to read work queue server address")?;

        let (closed, closed_rx) = watch::channel(false);
        let app = router(coordinator.clone(), settings, closed_rx.clone());
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(closing(closed_rx));
            if let Err(e) = serve.await {
                error!("Work queue server stopped: {}", e);
            }
        });

        let sweep_interval = Duration::from_millis(settings.sweep_interval_ms.max(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let reclaimed = coordinator.reclaim_expired().await;
                if reclaimed > 0 {
                    info!("Reclaimed {} expired lease(s)", reclaimed);
                }
            }
        });

        info!("Work queue server listening on http://{}{}", addr, API_PREFIX);

        Ok(Self { addr, closed, sweeper })
    }

    /// Base URL remote workers should be pointed at
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and release long-polling claims; requests
    /// already being answered finish first
    pub fn shutdown(self) {
        self.sweeper.abort();
        self.closed.send_replace(true);
        debug!("Work queue server on {} stopped", self.addr);
    }
}

/// Resolves once the server is shut down
async fn closing(mut closed: watch::Receiver<bool>) {
    if closed.wait_for(|closed| *closed).await.is_err() {
        // Sender gone without a shutdown
        std::future::pending::<()>().await;
    }
}

async fn claim_handler(State(state): State<Arc<ServerState>>, Json(request): Json<ClaimRequest>) -> Response {
    let kinds = if request.kinds.is_empty() {
        WorkKind::ALL.to_vec()
    } else {
        request.kinds
    };

    if *state.closed.borrow() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let claim = tokio::select! {
        biased;
        _ = closing(state.closed.clone()) => None,
        claim = state.coordinator.claim_lease(&request.worker_id, &kinds, state.lease, state.poll_timeout) => claim,
    };

    match claim {
        Some((item, lease)) => {
            let response = ClaimResponse {
                item,
                lease_token: lease.token,
                lease_expires_in_ms: millis(lease.duration),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn heartbeat_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    match state.coordinator.heartbeat(request.lease_token).await {
        Ok(remaining) => {
            let response = AckResponse {
                status: AckStatus::Ok,
                lease_expires_in_ms: Some(millis(remaining)),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            debug!("Heartbeat rejected: {}", e);
            (StatusCode::CONFLICT, Json(AckResponse::new(AckStatus::Expired))).into_response()
        }
    }
}

async fn finish_handler(State(state): State<Arc<ServerState>>, Json(request): Json<FinishRequest>) -> Response {
    let ack = state
        .coordinator
        .finish_lease(request.lease_token, request.output)
        .await;
    ack_response(ack, "finish")
}

async fn fail_handler(State(state): State<Arc<ServerState>>, Json(request): Json<FailRequest>) -> Response {
    let ack = state
        .coordinator
        .fail_lease(request.lease_token, request.error)
        .await;
    ack_response(ack, "fail")
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.coordinator.snapshot().await)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ack_response(ack: Result<LeaseAck, crate::queue::state::QueueError>, action: &str) -> Response {
    match ack {
        Ok(LeaseAck::Applied(_)) => (StatusCode::OK, Json(AckResponse::new(AckStatus::Ok))).into_response(),
        Ok(LeaseAck::Duplicate) => {
            debug!("Repeated {} ignored", action);
            (StatusCode::OK, Json(AckResponse::new(AckStatus::Duplicate))).into_response()
        }
        Err(e) => {
            // Stale tokens are a normal race with the reclaim sweep
            debug!("Rejected {}: {}", action, e);
            (StatusCode::CONFLICT, Json(AckResponse::new(AckStatus::Rejected))).into_response()
        }
    }
}
