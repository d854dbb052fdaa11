mod agent;
mod auth;
mod cli;
mod config;
mod control;
mod handlers;
mod protocol;
mod reaper;
mod registry;
mod relay;
mod rooms;
mod storage;
#[cfg(test)]
mod testutil;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    agent::AgentBridge,
    auth::TokenVerifier,
    cli::{Cli, Commands},
    config::Config,
    control::ControlRouter,
    handlers::{create_session, end_session, get_session_status, health_check, metrics_handler},
    registry::ConnectionRegistry,
    relay::SignalingRelay,
    rooms::RoomDirectory,
    storage::{RecordStore, RedisStore},
    websocket::{websocket_handler, AppState},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        session,
        token,
    }) = cli.command
    {
        if let Err(e) = cli::run_watch_client(url, session, token).await {
            error!("watch client error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting porthole-relay on port {}", config.port);
    info!("redis url: {}", config.redis_url);

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to install metrics recorder: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn RecordStore> =
        match RedisStore::connect(&config.redis_url, config.record_ttl_seconds).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("failed to connect to redis: {e}");
                std::process::exit(1);
            }
        };

    let config = Arc::new(config);
    let verifier = Arc::new(TokenVerifier::new(&config.auth_secret));
    let registry = Arc::new(ConnectionRegistry::new(store.clone()));
    let rooms = Arc::new(RoomDirectory::new(
        registry.clone(),
        store.clone(),
        config.active_ttl,
    ));
    let relay = Arc::new(SignalingRelay::new(
        rooms.clone(),
        registry.clone(),
        store.clone(),
    ));
    let control = Arc::new(ControlRouter::new(
        rooms.clone(),
        registry.clone(),
        store.clone(),
    ));
    let agents = Arc::new(AgentBridge::new(rooms.clone(), registry.clone()));

    reaper::spawn_reaper(rooms.clone(), store.clone(), config.reaper_interval);

    let state = AppState {
        config: config.clone(),
        store,
        verifier,
        registry,
        rooms,
        relay,
        control,
        agents,
        metrics,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", post(create_session))
        .route("/sessions/:code", get(get_session_status))
        .route("/sessions/:code/end", post(end_session))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("porthole-relay listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown signal received");
}
