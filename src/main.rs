// src/main.rs
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_poll::auth::SessionAuthenticator;
use live_poll::broadcast::Broadcaster;
use live_poll::clock::SystemClock;
use live_poll::config::Config;
use live_poll::db::{create_pool, run_migrations};
use live_poll::rate_limit::RateLimiter;
use live_poll::routes::{create_routes, AppState};
use live_poll::services::{PollService, ServiceSettings};
use live_poll::store::PgStore;
use live_poll::sweeper::spawn_sweeper;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,live_poll=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr = config.bind_addr()?;
    info!(
        %addr,
        max_connections = config.database.max_connections,
        sweep_interval = ?config.sweep_interval,
        "configuration loaded"
    );

    let pool = create_pool(&config.database).await?;
    run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool, config.storage_timeout));
    let broadcaster = Arc::new(Broadcaster::default());
    let clock = Arc::new(SystemClock);
    let service = Arc::new(PollService::new(
        store.clone(),
        broadcaster.clone(),
        clock.clone(),
        ServiceSettings::from(&config),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits));
    let sweeper = spawn_sweeper(
        Arc::clone(&service),
        Arc::clone(&rate_limiter),
        config.sweep_interval,
    );

    let state = AppState {
        service,
        authenticator: Arc::new(SessionAuthenticator::new(store, clock)),
        broadcaster,
        rate_limiter,
    };
    let app = create_routes(state);

    let handle = Handle::new();
    tokio::spawn(shutdown_on_ctrl_c(handle.clone()));

    info!(%addr, "listening");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_on_ctrl_c(handle: Handle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown requested, draining connections");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
