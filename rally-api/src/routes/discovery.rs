use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use validator::Validate;

use rally_matching::models::{Candidate, GeoPoint};
use rally_matching::services::DiscoveryQuery;
use rally_shared::errors::{AppError, AppResult};
use rally_shared::types::api::ApiResponse;
use rally_shared::types::auth::AuthUser;

use super::validated;
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct DiscoverParams {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: Option<f64>,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: Option<f64>,
    #[validate(range(min = 0.0))]
    pub max_distance_km: Option<f64>,
    #[validate(range(min = 1, max = 200))]
    pub limit: Option<u64>,
}

/// GET /discover - ranked candidates for the caller's deck
pub async fn discover(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<DiscoverParams>,
) -> AppResult<Json<ApiResponse<Vec<Candidate>>>> {
    let params = validated(params)?;

    let mut query = DiscoveryQuery::new(auth_user.id).limit(params.limit.unwrap_or(state.config.discovery_limit));
    match (params.lat, params.lng) {
        (Some(lat), Some(lng)) => query = query.near(GeoPoint::new(lat, lng)),
        (None, None) => {}
        _ => return Err(AppError::Validation("lat and lng must be given together".into())),
    }
    if let Some(radius) = params.max_distance_km {
        query = query.within_km(radius);
    }

    let candidates = state.discovery.discover(&query).await?;
    Ok(Json(ApiResponse::ok(candidates)))
}
