use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use rally_shared::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Health of the API and, on the remote backend, of the data service behind it.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let mut checks = Vec::new();

    if let Some(remote) = &state.remote {
        checks.push(match remote.rest().ping().await {
            Ok(()) => HealthCheck {
                name: "postgrest".into(),
                status: HealthStatus::Healthy,
                message: None,
            },
            Err(e) => HealthCheck {
                name: "postgrest".into(),
                status: HealthStatus::Unhealthy,
                message: Some(e.to_string()),
            },
        });
        checks.push(HealthCheck {
            name: "change_feed".into(),
            status: if remote.feed().is_connected() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: None,
        });
    }

    let response = HealthResponse::new("rally-api", env!("CARGO_PKG_VERSION"), checks);
    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
