//! HTTP API handlers for the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use lodestar_proto::{
    ClusterUsageReport, DoneResult, IdList, JobCancelRequest, JobCancelResponse, JobEvent,
    JobSubmitRequest, JobSubmitResponse, LeaseRequest, LeaseResponse, Queue, RenewalResult,
    ResourceVector,
};
use lodestar_state::{EventRepository, QueueRepository};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;

/// Shared application state.
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Render handle of the installed Prometheus recorder, when enabled.
    pub prometheus: Option<PrometheusHandle>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // Queues and jobs
        .route("/queues", post(create_queue))
        .route("/queues/{name}/resources", get(queued_resources))
        .route("/jobs", post(submit_jobs))
        .route("/jobs/cancel", post(cancel_jobs))
        .route("/events/{queue}/{job_set}", get(job_set_events))
        // Executor protocol
        .route("/usage", post(report_usage))
        .route("/lease", post(lease_jobs))
        .route("/lease/renew", post(renew_lease))
        .route("/lease/done", post(report_done))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "Metrics disabled".to_owned()),
    }
}

async fn create_queue(
    State(state): State<Arc<AppState>>,
    Json(queue): Json<Queue>,
) -> Result<StatusCode> {
    state.scheduler.submit.create_queue(queue).await?;
    Ok(StatusCode::CREATED)
}

/// Queued demand of a queue per pool, as of the last cache refresh.
async fn queued_resources(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<HashMap<String, ResourceVector>>> {
    if state
        .scheduler
        .repositories()
        .queues
        .get_queue(&name)
        .await?
        .is_none()
    {
        return Err(SchedulerError::QueueNotFound(name));
    }
    Ok(Json(state.scheduler.cache.queued_resources(&name)))
}

async fn submit_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobSubmitRequest>,
) -> Result<Json<JobSubmitResponse>> {
    let job_ids = state.scheduler.submit.submit_jobs(request).await?;
    Ok(Json(JobSubmitResponse { job_ids }))
}

async fn cancel_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobCancelRequest>,
) -> Result<Json<JobCancelResponse>> {
    let cancelled_ids = state.scheduler.submit.cancel_jobs(request).await?;
    Ok(Json(JobCancelResponse { cancelled_ids }))
}

async fn job_set_events(
    State(state): State<Arc<AppState>>,
    Path((queue, job_set)): Path<(String, String)>,
) -> Result<Json<Vec<JobEvent>>> {
    let events = state
        .scheduler
        .repositories()
        .events
        .read_events(&queue, &job_set)
        .await?;
    Ok(Json(events))
}

async fn report_usage(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ClusterUsageReport>,
) -> Result<Json<HashMap<String, f64>>> {
    Ok(Json(state.scheduler.usage.report_usage(report).await?))
}

async fn lease_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>> {
    let jobs = state.scheduler.lease.lease_jobs(&request).await?;
    Ok(Json(LeaseResponse { jobs }))
}

async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdList>,
) -> Result<Json<RenewalResult>> {
    let result = state
        .scheduler
        .lease
        .renew_lease(&request.cluster_id, &request.ids)
        .await?;
    Ok(Json(result))
}

async fn report_done(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdList>,
) -> Result<Json<DoneResult>> {
    let result = state
        .scheduler
        .lease
        .report_done(&request.cluster_id, &request.ids)
        .await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}
