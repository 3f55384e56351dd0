use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRef, State},
    routing::get,
    Json, Router,
};
use papertrade::application::broadcast::{websocket_handler, BroadcastHub};
use papertrade::application::services::orchestrator::{Orchestrator, PipelineHealth, StrategySpec};
use papertrade::config::SimulationConfig;
use papertrade::domain::errors::ConfigError;
use papertrade::domain::repositories::simulation_store::SimulationStore;
use papertrade::domain::services::strategies::StrategyFactory;
use papertrade::infrastructure::WebSocketTickFeed;
use papertrade::persistence::{init_database, InMemoryStore, SqliteStore};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    hub: Arc<BroadcastHub>,
    orchestrator: Arc<Orchestrator>,
}

impl FromRef<AppState> for Arc<BroadcastHub> {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "papertrade=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SimulationConfig::from_env()?;
    if config.broadcast.jwt_secret.is_empty() {
        return Err(ConfigError::Missing("JWT_SECRET".to_string()).into());
    }
    info!(
        "Papertrade starting: symbols {:?}, strategies {:?}, timeframe {}",
        config.symbols, config.strategies, config.timeframe
    );

    let store: Arc<dyn SimulationStore> = if config.database_url == "memory" {
        warn!("Using in-memory store, nothing will be persisted");
        Arc::new(InMemoryStore::new())
    } else {
        let pool = init_database(&config.database_url).await?;
        Arc::new(SqliteStore::new(pool))
    };

    let hub = Arc::new(BroadcastHub::new(config.broadcast.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_task = hub.spawn_heartbeat(shutdown_rx);

    let (events_tx, events_rx) = mpsc::channel(config.broadcast.event_buffer);
    let pump_task = hub.spawn_event_pump(events_rx);

    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        StrategyFactory::with_builtin(),
        store,
        events_tx,
    ));
    let feed = WebSocketTickFeed::new(config.feed.clone(), config.symbols.clone());
    let session_id = orchestrator
        .start(
            &config.symbols,
            &StrategySpec::from_ids(&config.strategies),
            Box::new(feed),
        )
        .await?;
    info!("Session {} running", session_id);

    let state = AppState {
        hub: hub.clone(),
        orchestrator: orchestrator.clone(),
    };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);

    let mut health = orchestrator.health();
    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let feed_failed = async {
            while health.changed().await.is_ok() {
                if let PipelineHealth::FeedFailed { reason, .. } = &*health.borrow() {
                    error!("Tick feed failed, shutting down: {}", reason);
                    return;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            _ = feed_failed => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutting down gracefully...");
    orchestrator.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_task.await;
    // Give the pump a moment to flush the final events
    drop(orchestrator);
    if tokio::time::timeout(Duration::from_secs(2), pump_task).await.is_err() {
        warn!("Event pump did not drain in time");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let session_id = state.orchestrator.session_id().await;
    let feed = match &*state.orchestrator.health().borrow() {
        PipelineHealth::FeedFailed { reason, .. } => json!({"status": "failed", "reason": reason}),
        PipelineHealth::Running { .. } => json!({"status": "running"}),
        PipelineHealth::Stopped { .. } => json!({"status": "stopped"}),
        PipelineHealth::Idle => json!({"status": "idle"}),
    };
    let status = if session_id.is_some() { "running" } else { "stopped" };
    let clients = state.hub.client_count().await;
    Json(json!({
        "status": status,
        "session_id": session_id,
        "feed": feed,
        "clients": clients,
        "history_events": state.hub.history().len(),
    }))
}
