//! Coordinator RPC surface.
//!
//! One axum router serves three audiences: workers (register/heartbeat),
//! clients (submit/status/cancel), and Raft peers (consensus RPCs carried
//! as JSON). Mutating routes are leader-only; non-leaders answer
//! `409 NotLeader` with a leader hint for the caller to chase.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{error, info};

use super::command::{ApplyOutcome, LogCommand};
use super::scheduler::Scheduler;
use crate::api::{
    ClusterStatus, HeartbeatRequest, JobReport, NotLeaderBody, RegisterRequest, SubmitJobRequest,
    SubmitJobResponse, TaskReport,
};
use crate::config::ClusterConfig;
use crate::consensus::network::{APPEND_ENTRIES_PATH, INSTALL_SNAPSHOT_PATH, VOTE_PATH};
use crate::consensus::{RaftHandle, TypeConfig};
use crate::error::{EngineError, Result};
use crate::model::{JobId, JobState};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ClusterConfig>,
    pub raft: RaftHandle,
    pub scheduler: Arc<Scheduler>,
}

/// Maps engine errors onto HTTP statuses; `NotLeader` carries the hint the
/// retry loop follows.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            EngineError::NotLeader { leader_hint } => (
                StatusCode::CONFLICT,
                Json(NotLeaderBody::new(leader_hint)),
            )
                .into_response(),
            EngineError::JobNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("unknown job {id}")).into_response()
            }
            EngineError::WorkerNotFound(id) => {
                (StatusCode::GONE, format!("unknown worker {id}")).into_response()
            }
            EngineError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
            }
            EngineError::Rejected(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response(),
            other => {
                error!(%other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
            }
        }
    }
}

pub fn router(context: AppContext) -> Router {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job))
        .route("/api/cluster", get(cluster_status))
        .route(APPEND_ENTRIES_PATH, post(raft_append_entries))
        .route(VOTE_PATH, post(raft_vote))
        .route(INSTALL_SNAPSHOT_PATH, post(raft_install_snapshot))
        .with_state(context)
}

/// Reject with a leader hint when this replica cannot serve a write.
fn require_leader(context: &AppContext) -> Result<()> {
    if context.raft.is_leader() {
        Ok(())
    } else {
        Err(EngineError::NotLeader {
            leader_hint: context.raft.leader_hint(),
        })
    }
}

async fn register(
    State(context): State<AppContext>,
    Json(request): Json<RegisterRequest>,
) -> std::result::Result<Json<crate::api::RegisterResponse>, ApiError> {
    require_leader(&context)?;
    Ok(Json(context.scheduler.handle_register(request).await?))
}

async fn heartbeat(
    State(context): State<AppContext>,
    Json(request): Json<HeartbeatRequest>,
) -> std::result::Result<Json<crate::api::HeartbeatResponse>, ApiError> {
    require_leader(&context)?;
    Ok(Json(context.scheduler.handle_heartbeat(request).await?))
}

async fn submit_job(
    State(context): State<AppContext>,
    Json(request): Json<SubmitJobRequest>,
) -> std::result::Result<Json<SubmitJobResponse>, ApiError> {
    require_leader(&context)?;
    let map_count = request
        .map_hint
        .unwrap_or(request.manifest.inputs.len() as u32);
    if map_count == 0 || map_count as usize > request.manifest.inputs.len() {
        return Err(EngineError::Config(format!(
            "map count {map_count} incompatible with {} input splits",
            request.manifest.inputs.len()
        ))
        .into());
    }
    if request.reduce_count == 0 {
        return Err(EngineError::Config("reduce count must be positive".into()).into());
    }
    let job_id = JobId::new();
    let outcome = context
        .raft
        .propose(LogCommand::JobSubmitted {
            job_id,
            manifest: request.manifest,
            map_count,
            reduce_count: request.reduce_count,
            submitted_at: Utc::now(),
        })
        .await?;
    match outcome {
        ApplyOutcome::Accepted | ApplyOutcome::Duplicate => {
            info!(%job_id, map_count, reduce_count = request.reduce_count, "job submitted");
            Ok(Json(SubmitJobResponse { job_id }))
        }
        ApplyOutcome::Rejected { reason } => Err(EngineError::Rejected(reason).into()),
    }
}

async fn get_job(
    State(context): State<AppContext>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobReport>, ApiError> {
    require_leader(&context)?;
    let job_id = JobId::parse(&job_id)
        .ok_or_else(|| EngineError::Config(format!("invalid job id: {job_id}")))?;
    let state = context.raft.state();
    let guard = state
        .read()
        .map_err(|_| EngineError::Internal("state lock poisoned".into()))?;
    let job = guard.job(&job_id).ok_or(EngineError::JobNotFound(job_id))?;
    let tasks = job
        .tasks()
        .map(|task| TaskReport {
            task: task.id,
            state: task.state,
            attempt: task.attempt,
            progress: task.progress,
        })
        .collect();
    let output_uris = if job.state == JobState::Completed {
        job.reduce_tasks
            .iter()
            .flat_map(|t| t.output_locations.iter().map(|o| o.uri.clone()))
            .collect()
    } else {
        Vec::new()
    };
    Ok(Json(JobReport {
        job_id,
        state: job.state,
        submitted_at: job.submitted_at,
        completed_at: job.completed_at,
        tasks,
        output_uris,
        failure_reason: job.failure_reason.clone(),
    }))
}

async fn cancel_job(
    State(context): State<AppContext>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobReport>, ApiError> {
    require_leader(&context)?;
    let parsed = JobId::parse(&job_id)
        .ok_or_else(|| EngineError::Config(format!("invalid job id: {job_id}")))?;
    let outcome = context
        .raft
        .propose(LogCommand::JobCancelled {
            job_id: parsed,
            reason: "cancelled by client".into(),
            cancelled_at: Utc::now(),
        })
        .await?;
    if let ApplyOutcome::Rejected { reason } = outcome {
        return Err(EngineError::Rejected(reason).into());
    }
    get_job(State(context), Path(job_id)).await
}

async fn cluster_status(State(context): State<AppContext>) -> Json<ClusterStatus> {
    let leader = context.raft.current_leader();
    Json(ClusterStatus {
        node_id: context.raft.node_id,
        is_leader: context.raft.is_leader(),
        leader,
        term: context.raft.current_term(),
        peers: context.config.peer_addrs(),
        healthy: leader.is_some(),
    })
}

// ── Raft peer RPCs ───────────────────────────────────────────────────────

async fn raft_append_entries(
    State(context): State<AppContext>,
    Json(rpc): Json<openraft::raft::AppendEntriesRequest<TypeConfig>>,
) -> Response {
    match context.raft.raft.append_entries(rpc).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn raft_vote(
    State(context): State<AppContext>,
    Json(rpc): Json<openraft::raft::VoteRequest<u64>>,
) -> Response {
    match context.raft.raft.vote(rpc).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn raft_install_snapshot(
    State(context): State<AppContext>,
    Json(rpc): Json<openraft::raft::InstallSnapshotRequest<TypeConfig>>,
) -> Response {
    match context.raft.raft.install_snapshot(rpc).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Bring up a full coordinator replica: Raft node, scheduler, RPC server.
/// Runs until the process exits.
pub async fn run(config: ClusterConfig) -> Result<()> {
    let config = Arc::new(config);
    let raft = crate::consensus::start(&config).await?;
    let store: Arc<dyn crate::storage::ObjectStore> =
        Arc::new(crate::storage::FsStore::new(config.store_root.clone()));
    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        raft.state().clone(),
        Arc::new(raft.clone()),
        store,
    ));
    tokio::spawn(scheduler.clone().run(raft.leadership_watch()));

    let context = AppContext {
        config: config.clone(),
        raft,
        scheduler,
    };
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding RPC listener on {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "coordinator listening");
    axum::serve(listener, router(context))
        .await
        .map_err(EngineError::Io)?;
    Ok(())
}
