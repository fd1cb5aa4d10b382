//! REST API handlers

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream;
use gpusched_core::{GpuDevice, GpuschedError, Job, JobRequest, JobStatus};
use gpusched_scheduler::{CapacityLedger, Dispatcher, PriorityFactors};
use gpusched_store::JobStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// Largest slice of a log sent in one stream frame
const LOG_CHUNK_BYTES: usize = 64 * 1024;

/// How often a followed log is polled for new output
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<JobStore>,
    pub dispatcher: Arc<Dispatcher>,
}

type ApiError = (StatusCode, String);

/// Create the API router
pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = Arc::new(AppState {
        store: dispatcher.store().clone(),
        dispatcher,
    });

    Router::new()
        .route("/api/v1/jobs/submit", post(submit_job))
        .route("/api/v1/jobs/queue", get(list_queue))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/logs", get(get_logs))
        .route("/api/v1/gpu/metrics", get(gpu_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: GpuschedError) -> ApiError {
    let status = match &e {
        GpuschedError::Validation(_) => StatusCode::BAD_REQUEST,
        GpuschedError::JobNotFound(_) => StatusCode::NOT_FOUND,
        GpuschedError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Request to submit a job
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Submitting user
    #[serde(default = "default_user")]
    pub user_id: String,
    /// Script content
    pub script: Option<String>,
    /// Original file name of the script
    #[serde(default)]
    pub script_name: Option<String>,
    /// Requested device memory in bytes
    pub vram_required: u64,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_qos")]
    pub qos: String,
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_partition() -> String {
    "normal".to_string()
}

fn default_qos() -> String {
    "standard".to_string()
}

/// Response for a submitted job
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority_score: f64,
}

/// Submit a new job
async fn submit_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(req) = body.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;
    let script = req
        .script
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing script".to_string()))?;

    let request = JobRequest {
        user_id: req.user_id,
        script_name: req.script_name,
        script: script.into_bytes(),
        vram_required: req.vram_required,
        partition: req.partition,
        qos: req.qos,
    };

    let job = state
        .dispatcher
        .submit(request)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id: job.id,
            status: job.status,
            priority_score: job.priority_score,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    /// Restrict the listing to one status
    pub status: Option<String>,
}

/// Queue listing entry
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority_score: f64,
    pub user_id: String,
    pub partition: String,
    pub qos: String,
    pub vram_required: u64,
    pub assigned_gpu_id: Option<u32>,
    pub submitted_at: DateTime<Utc>,
    /// Queued, but larger than every healthy device
    pub unschedulable: bool,
}

impl QueueEntry {
    fn new(job: Job, ledger: &CapacityLedger) -> Self {
        Self {
            unschedulable: job.status == JobStatus::Queued
                && !ledger.can_ever_fit(job.vram_required),
            id: job.id,
            status: job.status,
            priority_score: job.priority_score,
            user_id: job.user_id,
            partition: job.partition,
            qos: job.qos,
            vram_required: job.vram_required,
            assigned_gpu_id: job.assigned_gpu_id,
            submitted_at: job.submitted_at,
        }
    }
}

/// List jobs in queue order
async fn list_queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(error_response)?;

    let jobs = state.store.list(status).await;
    let ledger = CapacityLedger::new(&state.dispatcher.latest_devices().await, &[]);
    Ok(Json(
        jobs.into_iter()
            .map(|job| QueueEntry::new(job, &ledger))
            .collect(),
    ))
}

/// Job detail
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    /// Score inputs, while the job is queued
    pub priority_factors: Option<PriorityFactors>,
}

/// Get a specific job
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.store.get(id).await.map_err(error_response)?;

    let priority_factors = if job.status == JobStatus::Queued {
        let total_capacity = state.dispatcher.total_capacity().await;
        Some(
            state
                .dispatcher
                .engine()
                .breakdown(&job, Utc::now(), total_capacity),
        )
    } else {
        None
    };

    Ok(Json(JobResponse {
        job,
        priority_factors,
    }))
}

/// Latest GPU sample
async fn gpu_metrics(State(state): State<Arc<AppState>>) -> Json<Vec<GpuDevice>> {
    Json(state.dispatcher.latest_devices().await)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Keep the response open until the job finishes
    #[serde(default)]
    pub follow: bool,
    /// Byte offset to start from
    #[serde(default)]
    pub offset: u64,
}

/// Get the output of a job
async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    state.store.get(id).await.map_err(error_response)?;

    let content_type = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];

    if query.follow {
        debug!(job_id = %id, offset = query.offset, "Following job log");
    }
    let stream_state = LogStream {
        store: state.store.clone(),
        id,
        offset: query.offset,
        follow: query.follow,
    };
    // Dropping the body on client disconnect ends the stream
    let body = Body::from_stream(stream::unfold(Some(stream_state), next_log_chunk));
    Ok((content_type, body).into_response())
}

struct LogStream {
    store: Arc<JobStore>,
    id: Uuid,
    offset: u64,
    /// Wait for new output until the job is terminal
    follow: bool,
}

/// Yield log output in bounded chunks.
///
/// Without `follow` the stream ends at the current end of the log.
async fn next_log_chunk(
    state: Option<LogStream>,
) -> Option<(Result<Vec<u8>, GpuschedError>, Option<LogStream>)> {
    let mut log = state?;
    loop {
        // Status first: output written before the job finished is still read
        let finished = !log.follow
            || match log.store.get(log.id).await {
                Ok(job) => job.is_terminal(),
                Err(e) => return Some((Err(e), None)),
            };

        match log
            .store
            .read_log(log.id, log.offset, LOG_CHUNK_BYTES)
            .await
        {
            Ok(chunk) if !chunk.data.is_empty() => {
                log.offset = chunk.next_offset;
                return Some((Ok(chunk.data), Some(log)));
            }
            Ok(_) if finished => {
                if log.follow {
                    info!(job_id = %log.id, "Log stream finished");
                }
                return None;
            }
            Ok(_) => tokio::time::sleep(LOG_POLL_INTERVAL).await,
            Err(e) => return Some((Err(e), None)),
        }
    }
}
