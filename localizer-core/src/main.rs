use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use localizer_core::anchor_geometry::AnchorGeometry;
use localizer_core::bus::UdpJsonBus;
use localizer_core::coordinator::Coordinator;
use localizer_core::{config, error};
use uwb_types::TagId;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    let counters = state.coordinator.ingest_counters.snapshot();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
        "ingestRejections": {
            "invalidPayload": counters.invalid_payload,
            "unknownAnchor": counters.unknown_anchor,
            "invalidVector": counters.invalid_vector,
            "transportError": counters.transport_error,
        },
    }))
}

async fn tag_position(
    State(state): State<AppState>,
    Path(tag_id): Path<u32>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let position = state
        .coordinator
        .latest_position(TagId(tag_id))
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(json!({
        "tagId": tag_id,
        "position": { "x": position.position.x, "y": position.position.y, "z": position.position.z },
        "tUnixSecs": position.timestamp.seconds(),
        "residual": position.residual,
        "converged": position.converged,
        "nAnchorEdgesUsed": position.n_anchor_edges_used,
        "binStartSecs": position.bin_start.seconds(),
        "binEndSecs": position.bin_end.seconds(),
    })))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let startup_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "localizer_core=info".into()),
        )
        .init();

    let config_path = std::env::var("LOCALIZER_CONFIG").ok().map(std::path::PathBuf::from);
    let cfg = config::load(config_path.as_deref())?;

    info!(anchors = cfg.anchors.entries.len(), "loaded configuration");

    let geometry = Arc::new(AnchorGeometry::from_config(&cfg.anchors)?);

    let bus = Arc::new(
        UdpJsonBus::bind(&cfg.bus.host, cfg.bus.port, cfg.bus.base_topic.clone())
            .map_err(|e| error::InitError::BusUnreachableAtStartup(e.to_string()))?,
    );
    info!(host = %cfg.bus.host, port = cfg.bus.port, "message bus bound");

    let coordinator = Coordinator::new(Arc::clone(&geometry), &cfg, bus);
    coordinator.start();
    info!("coordinator started");

    let state = AppState { coordinator: Arc::clone(&coordinator) };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/tag/:id/position", get(tag_position))
        .layer(cors)
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down coordinator");
    coordinator.stop();

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
