use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use rally_matching::models::{SwipeAction, SwipeOutcome};
use rally_shared::errors::AppResult;
use rally_shared::types::api::ApiResponse;
use rally_shared::types::auth::AuthUser;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SwipeRequest {
    pub target_id: Uuid,
    pub action: SwipeAction,
}

/// POST /swipes - record a like or pass; reports the match when it is mutual
pub async fn swipe(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SwipeRequest>,
) -> AppResult<Json<ApiResponse<SwipeOutcome>>> {
    let outcome = state.swipes.swipe(auth_user.id, req.target_id, req.action).await?;

    let response = if outcome.is_match {
        ApiResponse::ok_with_message(outcome, "it's a match")
    } else {
        ApiResponse::ok(outcome)
    };
    Ok(Json(response))
}
