//! Ingress HTTP surface (spec §6: "CLI/HTTP framing is out of scope" for the
//! shape itself, but a framing still has to exist — this is it, grounded in
//! the corpus's thin-axum-handlers-over-a-shared-`State` convention).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use batchflow_actions::{NewRequest, SubmitError};
use batchflow_config::Settings;

use crate::App;

#[derive(Clone)]
struct ApiState {
    app: App,
    settings: Arc<Settings>,
}

pub fn router(app: App, settings: Settings) -> Router {
    let state = ApiState { app, settings: Arc::new(settings) };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/requests", post(submit_request))
        .route("/v1/batches/:id/cancel", post(cancel_batch))
        .route("/v1/batches/:id/redeliver", post(redeliver_batch))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    match state.app.store.pool().acquire().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequestBody {
    custom_id: String,
    model: String,
    endpoint: String,
    body: serde_json::Value,
    delivery: serde_json::Value,
}

/// `enqueue_request` (spec §4.6, §6): re-reads `Settings` on every call so a
/// hot-reloaded batch size cap takes effect immediately.
async fn submit_request(State(state): State<ApiState>, Json(req): Json<SubmitRequestBody>) -> impl IntoResponse {
    let settings = match batchflow_config::load_settings() {
        Ok(s) => s,
        Err(_) => (*state.settings).clone(),
    };

    let new = NewRequest {
        custom_id: req.custom_id,
        model: req.model,
        endpoint: req.endpoint,
        body: req.body,
        delivery: req.delivery,
    };

    match state.app.builder.submit(&settings, new).await {
        Ok(Ok(accepted)) => (StatusCode::ACCEPTED, Json(json!({ "custom_id": accepted.custom_id }))).into_response(),
        Ok(Err(SubmitError::Invalid(msg))) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid", "message": msg }))).into_response()
        }
        Ok(Err(SubmitError::DuplicateCustomId)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": "duplicate_custom_id" }))).into_response()
        }
        Ok(Err(SubmitError::BatchSizeWouldExceed)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": "batch_size_would_exceed" }))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to enqueue request");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal" }))).into_response()
        }
    }
}

async fn cancel_batch(State(state): State<ApiState>, Path(id): Path<i64>) -> impl IntoResponse {
    enqueue_operator_job(&state, "cancel", id).await
}

async fn redeliver_batch(State(state): State<ApiState>, Path(id): Path<i64>) -> impl IntoResponse {
    enqueue_operator_job(&state, "redeliver", id).await
}

async fn enqueue_operator_job(state: &ApiState, kind: &str, batch_id: i64) -> impl IntoResponse {
    let max_attempts = batchflow_queue::default_max_attempts(kind);
    match state
        .app
        .queue
        .enqueue(kind, &batch_id.to_string(), json!({ "batch_id": batch_id }), None, max_attempts, true)
        .await
    {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!(error = %e, kind, batch_id, "failed to enqueue operator job");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
