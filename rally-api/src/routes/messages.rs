use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_lite::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use rally_messaging::models::Message;
use rally_messaging::session::ChatSession;
use rally_notification::UnreadSnapshot;
use rally_shared::errors::AppResult;
use rally_shared::types::api::ApiResponse;
use rally_shared::types::auth::AuthUser;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: usize,
    /// Present once the caller has a live unread tracker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<UnreadSnapshot>,
}

/// GET /matches/:id/messages - full history, oldest first
pub async fn list_messages(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Vec<Message>>>> {
    state.matches.require_participant(match_id, auth_user.id).await?;
    let messages = state.chat.get_messages(match_id).await?;
    Ok(Json(ApiResponse::ok(messages)))
}

/// POST /matches/:id/messages - send a message
pub async fn send_message(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<Message>>)> {
    state.matches.require_participant(match_id, auth_user.id).await?;
    let message = state.chat.send_message(match_id, auth_user.id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

/// POST /matches/:id/read - mark the other player's messages read
pub async fn mark_as_read(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<MarkReadResponse>>> {
    state.matches.require_participant(match_id, auth_user.id).await?;
    let updated = state.chat.mark_match_messages_as_read(match_id, auth_user.id).await?;

    let unread = state
        .unread
        .get(auth_user.id)
        .map(|center| UnreadSnapshot::clone(&center.mark_match_as_read(match_id)));

    Ok(Json(ApiResponse::ok(MarkReadResponse { updated, unread })))
}

/// GET /matches/:id/messages/stream - new messages of the match as server-sent events
pub async fn stream_messages(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.matches.require_participant(match_id, auth_user.id).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = ChatSession::new(state.data.clone());
    session
        .subscribe_to_messages(match_id, move |message| {
            let _ = tx.send(message);
        })
        .await?;

    tracing::debug!(user_id = %auth_user.id, match_id = %match_id, "message stream opened");

    let stream = async_stream::stream! {
        // The session lives as long as the response body.
        let _session = session;
        while let Some(message) = rx.recv().await {
            match Event::default().event("message").json_data(&message) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(error = %e, "could not encode message event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
