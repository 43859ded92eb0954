use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_lite::Stream;
use serde::Serialize;
use uuid::Uuid;

use rally_notification::models::Notification;
use rally_notification::{NotificationCenter, UnreadSnapshot};
use rally_shared::errors::AppResult;
use rally_shared::types::api::ApiResponse;
use rally_shared::types::auth::AuthUser;
use rally_shared::types::pagination::{Paginated, PaginationParams};

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub updated: usize,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub stopped: bool,
}

async fn tracker(state: &AppState, user: &AuthUser) -> AppResult<Arc<NotificationCenter>> {
    state
        .unread
        .get_or_start(user.id, &state.notifications, &state.channels)
        .await
}

/// GET /notifications - social notifications, newest first
pub async fn list_notifications(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> AppResult<Json<ApiResponse<Paginated<Notification>>>> {
    let page = state.notifications.list_notifications(auth_user.id, &params).await?;
    Ok(Json(ApiResponse::ok(page)))
}

/// POST /notifications/:id/read
pub async fn mark_read(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Notification>>> {
    let notification = state
        .notifications
        .mark_notification_read(notification_id, auth_user.id)
        .await?;
    Ok(Json(ApiResponse::ok(notification)))
}

/// POST /notifications/mark-all-read
pub async fn mark_all_read(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<MarkAllReadResponse>>> {
    let updated = state.notifications.mark_all_read(auth_user.id).await?;
    Ok(Json(ApiResponse::ok(MarkAllReadResponse { updated })))
}

/// GET /notifications/unread - the caller's current unread snapshot
pub async fn unread(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<UnreadSnapshot>>> {
    let center = tracker(&state, &auth_user).await?;
    Ok(Json(ApiResponse::ok(UnreadSnapshot::clone(&center.snapshot()))))
}

/// POST /notifications/resync - recount everything from the data service
pub async fn resync(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<UnreadSnapshot>>> {
    let center = tracker(&state, &auth_user).await?;
    let snapshot = center.resync().await?;
    Ok(Json(ApiResponse::ok(UnreadSnapshot::clone(&snapshot))))
}

/// GET /notifications/stream - every new unread snapshot as a server-sent event
pub async fn stream(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (center, lease) = state
        .unread
        .watch(auth_user.id, &state.notifications, &state.channels)
        .await?;
    let mut rx = center.watch();
    drop(center);

    let stream = async_stream::stream! {
        // Pins the tracker while the client is connected.
        let _lease = lease;
        loop {
            let snapshot = rx.borrow_and_update().clone();
            match Event::default().event("unread").json_data(&*snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(error = %e, "could not encode unread snapshot"),
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /notifications/reset - stop tracking the caller's unread counters (sign-out)
pub async fn reset(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<ResetResponse>>> {
    let stopped = state.unread.stop(auth_user.id);
    Ok(Json(ApiResponse::ok(ResetResponse { stopped })))
}
