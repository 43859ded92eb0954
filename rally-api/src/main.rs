use std::sync::Arc;
use std::time::Duration;

use rally_api::config::{AppConfig, DataBackend};
use rally_api::AppState;
use rally_shared::clients::{DataService, MemoryDataService, PostgrestClient, RabbitMQClient, RemoteDataService};
use rally_shared::middleware::{init_metrics, init_tracing, set_jwt_secret};

const TRACKER_SWEEP_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("rally_api");

    let config = AppConfig::load()?;
    let port = config.port;
    set_jwt_secret(config.jwt_secret.clone());

    let metrics_handle = init_metrics()?;

    let (data, remote): (Arc<dyn DataService>, Option<RemoteDataService>) = match config.data_backend {
        DataBackend::Remote => {
            let rest = PostgrestClient::new(&config.postgrest_url, &config.service_key);
            let feed = RabbitMQClient::connect(&config.rabbitmq_url).await?;
            tracing::info!(postgrest = %config.postgrest_url, "connected to data service");
            let remote = RemoteDataService::new(rest, feed).with_echo_writes(config.echo_writes);
            (Arc::new(remote.clone()), Some(remote))
        }
        DataBackend::Memory => {
            tracing::warn!("using the in-memory data backend, nothing will persist");
            (Arc::new(MemoryDataService::new()), None)
        }
    };

    let idle = Duration::from_secs(config.unread_idle_secs);
    let state = Arc::new(AppState::new(config, data, remote, Some(metrics_handle)));
    let _sweeper = state.unread.spawn_sweeper(TRACKER_SWEEP_EVERY, idle);
    let app = rally_api::router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "rally-api starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
