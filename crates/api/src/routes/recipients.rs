//! Per-recipient inbox routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Notification, Page, PageRequest};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/recipients/{id}/notifications", get(list_notifications))
        .route(
            "/api/recipients/{id}/notifications/unread-count",
            get(unread_count),
        )
        .route(
            "/api/recipients/{id}/notifications/read-all",
            post(mark_all_read),
        )
        .route(
            "/api/recipients/{id}/notifications/{notification_id}/read",
            post(mark_read),
        )
}

/// GET /api/recipients/:id/notifications — Newest first, paginated.
async fn list_notifications(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<Notification>>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .list_by_recipient(recipient_id, page)
            .await?,
    ))
}

/// GET /api/recipients/:id/notifications/unread-count
async fn unread_count(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let unread = state.orchestrator.unread_count(recipient_id).await?;
    Ok(Json(json!({"recipient_id": recipient_id, "unread": unread})))
}

/// POST /api/recipients/:id/notifications/:notification_id/read
async fn mark_read(
    State(state): State<AppState>,
    Path((recipient_id, notification_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .mark_read(recipient_id, notification_id)
            .await?,
    ))
}

/// POST /api/recipients/:id/notifications/read-all
async fn mark_all_read(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = state.orchestrator.mark_all_read(recipient_id).await?;
    Ok(Json(json!({"updated": updated})))
}
