//! Notification submission and lookup routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BulkNotificationRequest, BulkResult, Notification, NotificationRequest, SubmitOutcome,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(submit))
        .route("/api/notifications/bulk", post(submit_bulk))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/delivered", post(confirm_delivery))
}

/// POST /api/notifications — Accept one notification for delivery.
async fn submit(
    State(state): State<AppState>,
    Json(request): Json<NotificationRequest>,
) -> Result<Response, AppError> {
    let response = match state.orchestrator.submit(request).await? {
        SubmitOutcome::Created(reference) => (StatusCode::ACCEPTED, Json(reference)).into_response(),
        SubmitOutcome::Duplicate { event_id } => (
            StatusCode::OK,
            Json(json!({"duplicate": true, "event_id": event_id})),
        )
            .into_response(),
    };
    Ok(response)
}

/// POST /api/notifications/bulk — Same content to many recipients.
async fn submit_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkNotificationRequest>,
) -> Result<(StatusCode, Json<BulkResult>), AppError> {
    let result = state.orchestrator.submit_bulk(request).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

/// GET /api/notifications/:id — Current state of one notification.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.orchestrator.get(id).await?))
}

/// POST /api/notifications/:id/delivered — Provider delivery receipt.
async fn confirm_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.orchestrator.confirm_delivery(id).await?))
}
