use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use rally_matching::models::{MatchProposal, MatchSummary, ProposalStatus};
use rally_shared::errors::AppResult;
use rally_shared::types::api::ApiResponse;
use rally_shared::types::auth::AuthUser;

use super::validated;
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProposalRequest {
    pub scheduled_at: DateTime<Utc>,
    #[validate(length(max = 120, message = "court name is too long"))]
    pub court_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub status: ProposalStatus,
}

/// GET /matches - matches, newest first, each with its active session proposal
pub async fn list_matches(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<MatchSummary>>>> {
    let summaries = state.matches.match_summaries(auth_user.id, &state.proposals).await?;
    Ok(Json(ApiResponse::ok(summaries)))
}

/// GET /matches/:id/proposals - every proposal of the match, newest first
pub async fn list_proposals(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Vec<MatchProposal>>>> {
    state.matches.require_participant(match_id, auth_user.id).await?;
    let proposals = state.proposals.get_proposals(match_id).await?;
    Ok(Json(ApiResponse::ok(proposals)))
}

/// POST /matches/:id/proposals - propose a session to the other player
pub async fn create_proposal(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<Uuid>,
    Json(req): Json<CreateProposalRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<MatchProposal>>)> {
    let req = validated(req)?;
    let proposal = state
        .proposals
        .create_proposal(match_id, auth_user.id, req.scheduled_at, req.court_name)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(proposal))))
}

/// POST /proposals/:id/respond - accept, decline or cancel
pub async fn respond_to_proposal(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(proposal_id): Path<Uuid>,
    Json(req): Json<RespondRequest>,
) -> AppResult<Json<ApiResponse<MatchProposal>>> {
    let proposal = state
        .proposals
        .respond_to_proposal(proposal_id, auth_user.id, req.status)
        .await?;
    Ok(Json(ApiResponse::ok(proposal)))
}

/// GET /proposals/:id/calendar.ics - the session as an iCalendar download
pub async fn proposal_calendar(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(proposal_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let event = state.proposals.calendar_event(proposal_id, auth_user.id).await?;
    let headers = [
        (header::CONTENT_TYPE, "text/calendar; charset=utf-8".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", event.file_name())),
        (header::LINK, format!("<{}>; rel=\"alternate\"", event.google_calendar_url())),
    ];
    Ok((headers, event.to_ics()))
}
