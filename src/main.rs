// CertHub Control Plane API Server

use certhub_control_plane::{
    config::Settings,
    create_router, db,
    mailer::Mailer,
    queue::Queue,
    rate_limit::RateLimiter,
    security::JwtCodec,
    watcher::{self, WatcherConfig},
    workers, AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::load()?);

    init_tracing(&settings);

    if settings.is_prod() && settings.jwt_secret == "insecure-dev-secret" {
        anyhow::bail!("JWT_SECRET must be set in production");
    }

    let db_config = db::DatabaseConfig::new(&settings.database_url);
    let db_pool = db::create_pool(&db_config).await?;
    db::run_migrations(&db_pool).await?;
    tracing::info!("database migrations completed");

    let jwt = JwtCodec::new(&settings.jwt_secret);
    let rate_limiter = RateLimiter::connect(&settings.redis_url).await;
    let queue = Queue::connect(&settings.redis_url, &settings.rq_queue_name).await;
    let mailer = Mailer::from_settings(&settings);

    let state = AppState {
        settings: settings.clone(),
        jwt,
        db_pool: db_pool.clone(),
        rate_limiter,
        queue: queue.clone(),
        mailer,
    };

    if settings.worker_enabled {
        tokio::spawn(workers::run_worker(
            db_pool.clone(),
            queue.clone(),
            settings.clone(),
        ));
    }

    if settings.watcher_enabled {
        let watcher_config = WatcherConfig {
            org_id: settings.default_org_id,
            root_path: settings.certs_root_path.clone(),
            debounce: Duration::from_secs_f64(settings.watcher_debounce_seconds),
            max_events_per_minute: settings.watcher_max_events_per_minute,
        };
        let watcher_queue = queue.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher::run_watcher(watcher_queue, watcher_config).await {
                tracing::error!(error = %e, "drop-zone watcher exited");
            }
        });
    }

    let app = create_router(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!("starting CertHub control plane on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(settings: &Settings) {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,certhub_control_plane=debug".into());

    if settings.is_prod() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    }
}
