use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use rally_matching::services::{DiscoveryService, MatchService, ProposalService, SwipeService};
use rally_messaging::services::ChatService;
use rally_notification::NotificationService;
use rally_shared::clients::{Channels, DataService, RemoteDataService};
use rally_shared::middleware::metrics_middleware;

pub mod config;
pub mod routes;
pub mod trackers;


use config::AppConfig;
use trackers::UnreadTrackers;

pub struct AppState {
    pub config: AppConfig,
    pub data: Arc<dyn DataService>,
    /// Set for the remote backend; health probes go through it.
    pub remote: Option<RemoteDataService>,
    pub channels: Channels,
    pub discovery: DiscoveryService,
    pub swipes: SwipeService,
    pub matches: MatchService,
    pub proposals: ProposalService,
    pub chat: ChatService,
    pub notifications: NotificationService,
    pub unread: Arc<UnreadTrackers>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        data: Arc<dyn DataService>,
        remote: Option<RemoteDataService>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let unread_resync = Duration::from_secs(config.unread_resync_secs);
        Self {
            config,
            remote,
            channels: Channels::new(data.clone()),
            discovery: DiscoveryService::new(data.clone()),
            swipes: SwipeService::new(data.clone()),
            matches: MatchService::new(data.clone()),
            proposals: ProposalService::new(data.clone()),
            chat: ChatService::new(data.clone()),
            notifications: NotificationService::new(data.clone()),
            unread: Arc::new(UnreadTrackers::new(unread_resync)),
            metrics_handle,
            data,
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}

pub fn router(state: Arc<AppState>) -> Router {
    use routes::{discovery, health, matches, messages, notifications, swipes};

    Router::new()
        // Discovery and swipes
        .route("/discover", get(discovery::discover))
        .route("/swipes", post(swipes::swipe))
        // Matches and proposals
        .route("/matches", get(matches::list_matches))
        .route(
            "/matches/:id/proposals",
            get(matches::list_proposals).post(matches::create_proposal),
        )
        .route("/proposals/:id/respond", post(matches::respond_to_proposal))
        .route("/proposals/:id/calendar.ics", get(matches::proposal_calendar))
        // Chat
        .route(
            "/matches/:id/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/matches/:id/messages/stream", get(messages::stream_messages))
        .route("/matches/:id/read", post(messages::mark_as_read))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/notifications/mark-all-read", post(notifications::mark_all_read))
        .route("/notifications/unread", get(notifications::unread))
        .route("/notifications/resync", post(notifications::resync))
        .route("/notifications/stream", get(notifications::stream))
        .route("/notifications/reset", post(notifications::reset))
        .route_layer(axum::middleware::from_fn(metrics_middleware))
        // Unmetered
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
