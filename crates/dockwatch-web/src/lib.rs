//! Axum JSON dashboard for Dockwatch.
//!
//! Read-only views over the snapshot store plus a manual-trigger endpoint
//! that runs one monitor cycle synchronously.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dockwatch_core::Listing;
use dockwatch_monitor::{Monitor, MonitorError, SourceRegistry};
use serde::Serialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "dockwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub registry: Arc<SourceRegistry>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>, registry: Arc<SourceRegistry>) -> Self {
        Self { monitor, registry }
    }
}

#[derive(Debug, Serialize)]
struct SourceInventory {
    key: String,
    display_name: String,
    last_updated: Option<DateTime<Utc>>,
    listings: Vec<Listing>,
}

#[derive(Debug, Serialize)]
struct InventoryResponse {
    timestamp: Option<DateTime<Utc>>,
    sources: Vec<SourceInventory>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/inventory", get(inventory_handler))
        .route("/api/sources/{key}", get(source_handler))
        .route("/api/sources/{key}/run", post(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("DOCKWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
    .into_response()
}

async fn inventory_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut sources = Vec::new();
    let mut registered = std::collections::HashSet::new();
    for entry in &state.registry.sources {
        registered.insert(entry.spec.key.clone());
        match load_source_inventory(&state, &entry.spec.key, &entry.spec.display_name).await {
            Ok(inventory) => sources.push(inventory),
            Err(err) => return server_error(err),
        }
    }

    // Snapshots can outlive their registry entry; surface those too so a
    // source removed from sources.yaml does not silently vanish.
    let stored_keys = match state.monitor.store().known_sources().await {
        Ok(keys) => keys,
        Err(err) => return server_error(err.into()),
    };
    for key in stored_keys {
        if registered.contains(&key) {
            continue;
        }
        match load_source_inventory(&state, &key, &key).await {
            Ok(inventory) => sources.push(inventory),
            Err(err) => return server_error(err),
        }
    }

    let timestamp = sources.iter().filter_map(|s| s.last_updated).max();
    Json(InventoryResponse { timestamp, sources }).into_response()
}

async fn source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    let Some(entry) = state.registry.find(&key) else {
        return not_found(&key);
    };
    match load_source_inventory(&state, &entry.spec.key, &entry.spec.display_name).await {
        Ok(inventory) => Json(inventory).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    let Some(entry) = state.registry.find(&key) else {
        return not_found(&key);
    };
    match state.monitor.run_source(entry).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err @ MonitorError::Fetch(_)) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

async fn load_source_inventory(
    state: &AppState,
    key: &str,
    display_name: &str,
) -> anyhow::Result<SourceInventory> {
    let listings = state.monitor.store().load(key).await?.unwrap_or_default();
    let last_updated = state.monitor.store().last_updated(key).await?;
    Ok(SourceInventory {
        key: key.to_string(),
        display_name: display_name.to_string(),
        last_updated,
        listings,
    })
}

fn not_found(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("unknown source {key}")})),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}
