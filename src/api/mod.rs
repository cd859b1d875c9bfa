use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::CoderunError;
use crate::scheduler::Job;
use crate::service::{StatusReporter, SubmissionGate};
use crate::toolchain::Language;

const DEFAULT_LANGUAGE: &str = "cpp";

#[derive(Clone)]
pub struct ApiState {
    pub gate: SubmissionGate,
    pub reporter: StatusReporter,
    pub workers: usize,
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default = "default_language")]
    language: String,
    code: Option<String>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    job_id: Uuid,
}

#[derive(Deserialize)]
struct StatusQuery {
    id: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    job: Job,
}

#[derive(Serialize)]
struct JobListResponse {
    success: bool,
    jobs: Vec<Job>,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    queue_depth: usize,
    queue_capacity: usize,
    workers: usize,
}

#[derive(Serialize)]
struct LanguageInfo {
    id: &'static str,
    extension: &'static str,
    compiled: bool,
}

pub fn router(state: ApiState) -> Router {
    // The browser client is served from a different origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/languages", get(languages_handler))
        .route("/run", post(run_handler))
        .route("/status", get(status_handler))
        .route("/jobs", get(list_jobs_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
            return Err(e);
        }
    };
    tracing::info!(addr = %listener.local_addr()?, "Starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn error_response(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

fn rejection(e: CoderunError) -> Response {
    let status = match e {
        CoderunError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        CoderunError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        CoderunError::JobNotFound(_) => StatusCode::BAD_REQUEST,
        ref e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.kind(), e.to_string())
}

async fn index_handler() -> impl IntoResponse {
    Json(json!({ "hello": "world" }))
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let queue = state.gate.queue();
    Json(HealthResponse {
        status: if queue.is_closed() { "stopping" } else { "ok" },
        queue_depth: queue.depth(),
        queue_capacity: queue.capacity(),
        workers: state.workers,
    })
}

async fn languages_handler() -> impl IntoResponse {
    let languages: Vec<LanguageInfo> = Language::ALL
        .iter()
        .map(|lang| {
            let toolchain = lang.toolchain();
            LanguageInfo {
                id: lang.id(),
                extension: toolchain.extension,
                compiled: toolchain.compile.is_some(),
            }
        })
        .collect();
    Json(languages)
}

async fn run_handler(
    State(state): State<ApiState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "InvalidRequest", e.body_text()),
    };

    match state
        .gate
        .submit(&request.language, request.code.as_deref())
        .await
    {
        Ok(job_id) => (StatusCode::CREATED, Json(RunResponse { job_id })).into_response(),
        Err(e) => rejection(e),
    }
}

async fn status_handler(
    State(state): State<ApiState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let raw = match query.id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MissingId",
                "Missing `id` query parameter",
            )
        }
    };
    let Ok(id) = Uuid::parse_str(raw) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "NotFound",
            format!("Job not found: {}", raw),
        );
    };

    match state.reporter.status(&id).await {
        Ok(job) => Json(StatusResponse { success: true, job }).into_response(),
        Err(e) => rejection(e),
    }
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Response {
    match state.reporter.list().await {
        Ok(jobs) => Json(JobListResponse {
            success: true,
            jobs,
        })
        .into_response(),
        Err(e) => rejection(e),
    }
}
