use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use meshline_agent::{Error, WebhookOutcome};
use meshline_task::{ServiceKind, TaskId, WebhookPayload};
use serde::Serialize;

use crate::security::{self, RequestMeta, json_error};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/meshy", post(webhook))
        .route("/webhooks/meshy/:entity/:stage", post(webhook_for_stage))
        .route("/entities/:entity/pending", get(pending))
        .route("/tasks/:task_id", get(task))
        .route("/tasks/:task_id/progress", get(progress))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn error_response(err: &Error, request_id: &str) -> Response {
    let code = match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        // Retryable; the provider redelivers on 5xx.
        Error::StaleManifest { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        tracing::error!(%request_id, error = %err, "request failed");
    }
    json_error(code, err.to_string())
}

async fn webhook(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, &meta, None, None, &headers, &body).await
}

async fn webhook_for_stage(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path((entity, stage)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(stage) = stage.parse::<ServiceKind>() else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown stage {stage:?}"));
    };
    receive(&state, &meta, Some(&entity), Some(stage), &headers, &body).await
}

async fn receive(
    state: &AppState,
    meta: &RequestMeta,
    entity: Option<&str>,
    stage: Option<ServiceKind>,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let request_id = meta.request_id.as_str();
    if let Some(secret) = &state.webhook_secret {
        if !security::verify_signature(secret, headers, body) {
            tracing::warn!(%request_id, entity = entity.unwrap_or("-"), "webhook signature rejected");
            return json_error(StatusCode::UNAUTHORIZED, "invalid webhook signature");
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%request_id, error = %e, "unparseable webhook payload");
            return json_error(StatusCode::BAD_REQUEST, format!("invalid webhook payload: {e}"));
        }
    };

    match state.handler.handle(payload, entity).await {
        Ok(outcome @ WebhookOutcome::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(outcome)).into_response()
        }
        Ok(outcome) => {
            if let (Some(expected), WebhookOutcome::Processed { service, task_id, .. }) =
                (stage, &outcome)
            {
                if expected != *service {
                    tracing::warn!(%request_id, %task_id, %expected, actual = %service, "webhook delivered on another stage's path");
                }
            }
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => error_response(&e, request_id),
    }
}

async fn pending(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(entity): Path<String>,
) -> Response {
    match state.repository.list_pending(&entity).await {
        Ok(assets) => Json(assets).into_response(),
        Err(e) => error_response(&e, &meta.request_id),
    }
}

async fn task(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(task_id): Path<String>,
) -> Response {
    let task_id = TaskId::from(task_id);
    match state.repository.find_by_task_id(&task_id, None).await {
        Ok(Some(loc)) => Json(serde_json::json!({
            "entity": loc.entity,
            "spec_hash": loc.spec_hash,
            "task": loc.asset.entry(&task_id),
            "asset": loc.asset,
        }))
        .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("task {task_id} not found")),
        Err(e) => error_response(&e, &meta.request_id),
    }
}

async fn progress(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let task_id = TaskId::from(task_id);
    match state.progress.get(&task_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => json_error(
            StatusCode::NOT_FOUND,
            format!("no progress recorded for {task_id}"),
        ),
    }
}
