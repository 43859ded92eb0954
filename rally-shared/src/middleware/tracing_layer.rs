use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `RALLY_LOG_FORMAT` (`json` | `pretty`) wins; otherwise `RALLY_ENV=production` means JSON.
    pub fn from_env() -> Self {
        Self::resolve(
            std::env::var("RALLY_LOG_FORMAT").ok().as_deref(),
            std::env::var("RALLY_ENV").ok().as_deref(),
        )
    }

    fn resolve(format: Option<&str>, env: Option<&str>) -> Self {
        match (format, env) {
            (Some("json"), _) => Self::Json,
            (Some("pretty"), _) => Self::Pretty,
            (_, Some("production")) => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn default_filter(service_name: &str) -> String {
    format!("info,{service_name}=debug,rally_notification=debug,tower_http=debug")
}

pub fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(service_name)));
    let format = LogFormat::from_env();
    let registry = tracing_subscriber::registry().with(env_filter);

    // A subscriber installed earlier (tests, embedding binaries) stays in place.
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_file(true).with_line_number(true))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(service = service_name, format = ?format, "tracing initialized");
    }
}
