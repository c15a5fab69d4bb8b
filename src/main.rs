use axum::{middleware::from_fn_with_state, routing::get, Router};
use livescore_hub::app_state::AppState;
use livescore_hub::config::HubConfig;
use livescore_hub::fetcher;
use livescore_hub::handlers::{
    commentary_handler, health_check, highlights_handler, live_matches_handler, match_handler,
    player_handler, standings_handler, stats_handler,
};
use livescore_hub::hub::Hub;
use livescore_hub::middleware::{rate_limit, security_headers, RateLimitState};
use livescore_hub::persistence::{init_database, spawn_snapshot_task, SnapshotStore};
use livescore_hub::scheduler::BroadcastScheduler;
use livescore_hub::websocket::ws_handler;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HubConfig::from_env();
    config.validate()?;

    info!("Initializing database...");
    let pool = init_database(&config.database_file).await?;
    let store = SnapshotStore::new(pool);

    let fetcher = fetcher::from_config(&config.fetcher, config.fetch_timeout)?;
    let port = config.port;
    let snapshot_max_age = config.snapshot_max_age;
    let rate_limit_state = RateLimitState::new(config.rate_limit_max, config.rate_limit_window);
    let hub = Arc::new(Hub::new(config, fetcher));

    if let Err(e) = store.warm_cache(&hub, snapshot_max_age).await {
        error!("Cache warm-up skipped: {}", e);
    }

    let scheduler = BroadcastScheduler::start(hub.clone());
    let (snapshot_stop_tx, snapshot_stop_rx) = watch::channel(false);
    let snapshot_task = spawn_snapshot_task(hub.clone(), store.clone(), snapshot_stop_rx);

    let state = AppState::new(hub.clone(), store.clone());

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/matches/live", get(live_matches_handler))
        .route("/api/matches/{id}", get(match_handler))
        .route("/api/matches/{id}/commentary", get(commentary_handler))
        .route("/api/matches/{id}/highlights", get(highlights_handler))
        .route("/api/series/{id}/points", get(standings_handler))
        .route("/api/players/{id}", get(player_handler))
        .route("/api/stats", get(stats_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(from_fn_with_state(rate_limit_state, rate_limit));
    let app = security_headers(app)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        // Les sessions doivent se fermer pour que le serveur finisse de se vider.
        shutdown_hub.begin_shutdown();
    })
    .await?;

    scheduler.stop().await;
    snapshot_stop_tx.send_replace(true);
    if let Err(e) = snapshot_task.await {
        error!("Snapshot task failed: {}", e);
    }
    store.flush().await;
    info!("Shutdown complete");

    Ok(())
}
