use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use softhold_api::config;
use softhold_api::db;
use softhold_api::events;
use softhold_api::handlers::{self, AppServices};
use softhold_api::rate_limiter::{RateLimitConfig, RateLimiter};
use softhold_api::services::ReservationSweeper;
use softhold_api::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config().context("configuration is invalid")?;
    config::init_tracing(&config.log_level, config.log_json);

    info!(environment = %config.environment, "softhold API starting");

    let pool = db::establish_connection_from_app_config(&config)
        .await
        .map_err(|e| {
            error!("failed to connect to database: {}", e);
            e
        })
        .context("database connection failed")?;

    if config.auto_migrate {
        db::run_migrations(&pool)
            .await
            .map_err(|e| {
                error!("schema bootstrap failed: {}", e);
                e
            })
            .context("failed to create required tables and indexes")?;
    }

    let db = Arc::new(pool);

    let (event_sender, event_rx) = events::channel(256);
    tokio::spawn(events::process_events(event_rx));

    let services = AppServices::new(db.clone(), event_sender.clone(), &config);

    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_window: config.rate_limit_requests_per_window,
        window: Duration::from_secs(config.rate_limit_window_seconds),
    }));

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        services: services.clone(),
        rate_limiter,
    };

    let sweeper = Arc::new(ReservationSweeper::new(
        db,
        services.inventory.clone(),
        services.reservations.clone(),
        event_sender,
        config.sweep_interval(),
    ));
    let sweeper_handle = sweeper.spawn();

    let app = handlers::router(state);

    let host: std::net::IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid bind host '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Cancel the next sweep and wait for any in-flight cycle.
    sweeper_handle.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
