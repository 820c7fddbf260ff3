//! Notification list and read-management routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crewflow_common::error::AppError;
use crewflow_common::types::Notification;
use crewflow_notify::store::{ListOptions, NotificationStore};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/{id}/read", post(mark_read))
}

/// GET /api/notifications — List the authenticated identity's notifications,
/// newest first.
async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(opts): Query<ListOptions>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let notifications =
        NotificationStore::list_for_recipient(&state.pool, auth.user_id, &auth.roles, &opts)
            .await?;
    Ok(Json(notifications))
}

/// POST /api/notifications/:id/read — Mark one notification read.
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification =
        NotificationStore::mark_read(&state.pool, id, auth.user_id, &auth.roles).await?;
    Ok(Json(notification))
}
