//! HTTP surface of the daemon.
//!
//! - `POST /webhook` - signed action trigger
//! - `GET /job/status?id=` - job lookup
//! - `GET /health` - liveness, no auth

use crate::auth::{AuthError, Authenticator};
use crate::config::SERVICE_NAME;
use crate::jobs::{Action, JobRegistry, JobState};
use crate::rate_limit::{Admission, RateLimiter, client_key};
use crate::worker_pool::{Task, WorkerPool};
use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;
const QUEUE_FULL_ERROR: &str = "queue_full";

/// Shared state for HTTP handlers.
pub struct AppState {
    pub auth: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub jobs: Arc<JobRegistry>,
    pub pool: Arc<WorkerPool>,
    pub body_limit: usize,
}

#[derive(Deserialize)]
struct WebhookRequest {
    action: Action,
    #[allow(dead_code)]
    timestamp: i64,
}

#[derive(Deserialize)]
struct StatusQuery {
    id: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/job/status", get(job_status_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

fn api_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": kind,
            "message": message,
        })),
    )
        .into_response()
}

fn payload_too_large() -> Response {
    api_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        "oversized_body",
        "request body too large",
    )
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn auth_rejection(err: &AuthError) -> Response {
    match err {
        AuthError::StaleRequest | AuthError::BadPayload => {
            api_error(StatusCode::BAD_REQUEST, err.kind(), &err.to_string())
        }
        // One body for every signature failure.
        _ => api_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication failed",
        ),
    }
}

async fn webhook_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    if declared_length(&parts.headers).is_some_and(|len| len > state.body_limit) {
        return payload_too_large();
    }
    let body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(body) => body,
        Err(err) => {
            debug!(err = %err, "webhook body rejected");
            return payload_too_large();
        }
    };

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_key(&parts.headers, peer);
    if state.limiter.admit(&client) == Admission::Denied {
        warn!(client = %client, "webhook rate limited");
        let mut response = api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests",
        );
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        return response;
    }

    if let Err(err) = state.auth.authenticate(&body, &parts.headers) {
        warn!(client = %client, kind = err.kind(), "webhook authentication failed");
        return auth_rejection(&err);
    }

    let request: WebhookRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(client = %client, err = %err, "webhook payload rejected");
            return api_error(
                StatusCode::BAD_REQUEST,
                "bad_payload",
                "request body must carry a known action and a timestamp",
            );
        }
    };

    let action = request.action;
    let job_id = state.jobs.create(action);
    let submitted = state.pool.submit(Task {
        job_id: job_id.clone(),
        action,
    });
    match submitted {
        Ok(()) => info!(client = %client, job_id = %job_id, action = %action, "job queued"),
        Err(err) => {
            warn!(job_id = %job_id, kind = err.kind(), "job could not be queued");
            if let Err(err) = state.jobs.transition(
                &job_id,
                JobState::Failed,
                Some(QUEUE_FULL_ERROR.to_string()),
            ) {
                warn!(job_id = %job_id, err = %err, "could not fail rejected job");
            }
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "job_id": job_id,
            "message": format!("Action '{action}' queued for processing"),
        })),
    )
        .into_response()
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "missing_id", "query parameter `id` is required");
    };
    match state.jobs.get(&id) {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "job_not_found", "no job with that id"),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}
