//! JSON HTTP API over the planet store and the sync scheduler.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use planets_core::PlanetRecord;
use planets_storage::{PlanetStore, StoreError};
use planets_sync::{SyncError, SyncScheduler};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "planets-web";

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PlanetStore>,
    pub scheduler: Arc<SyncScheduler>,
}

impl AppState {
    /// Handlers read through the scheduler's store so both share one backend.
    pub fn new(scheduler: Arc<SyncScheduler>) -> Self {
        Self {
            store: scheduler.store().clone(),
            scheduler,
        }
    }
}

/// Request bodies accept one planet or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PlanetRecord),
    Many(Vec<PlanetRecord>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<PlanetRecord> {
        match self {
            Self::One(record) => vec![record],
            Self::Many(records) => records,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    wait: Option<bool>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/planets",
            get(list_planets_handler)
                .post(create_planets_handler)
                .put(update_planets_handler),
        )
        .route("/planets/{name}", get(get_planet_handler).delete(delete_planet_handler))
        .route("/sync", post(trigger_sync_handler))
        .route("/sync/status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("SWAPI_SERVER_PORT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "planets API listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.scheduler.status();
    Json(json!({
        "status": "OK",
        "scheduler": status.state,
        "store": state.store.backend(),
    }))
    .into_response()
}

async fn list_planets_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(mut planets) => {
            planets.sort_by(|a, b| a.name.cmp(&b.name));
            Json(planets).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn get_planet_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.store.get(&name).await {
        Ok(Some(planet)) => Json(planet).into_response(),
        Ok(None) => not_found(&name),
        Err(err) => store_error(err),
    }
}

async fn create_planets_handler(State(state): State<Arc<AppState>>, Json(body): Json<OneOrMany>) -> Response {
    let records = body.into_vec();
    if let Some(response) = reject_blank_names(&records) {
        return response;
    }
    match state.store.create(&records).await {
        Ok(result) => {
            let status = if result.created.is_empty() && !result.conflicts.is_empty() {
                StatusCode::CONFLICT
            } else {
                StatusCode::CREATED
            };
            info!(created = result.created.len(), conflicts = result.conflicts.len(), "planets created");
            (status, Json(result)).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn update_planets_handler(State(state): State<Arc<AppState>>, Json(body): Json<OneOrMany>) -> Response {
    let records = body.into_vec();
    if let Some(response) = reject_blank_names(&records) {
        return response;
    }
    match state.store.update(&records).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_planet_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.store.delete(&name).await {
        Ok(true) => {
            info!(planet = %name, "planet deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(&name),
        Err(err) => store_error(err),
    }
}

async fn trigger_sync_handler(State(state): State<Arc<AppState>>, Query(query): Query<SyncQuery>) -> Response {
    let outcome = if query.wait.unwrap_or(true) {
        state.scheduler.trigger_sync().await
    } else {
        state.scheduler.try_trigger_sync().await
    };
    match outcome {
        Ok(result) => Json(result).into_response(),
        Err(err) => (sync_error_status(&err), Json(err)).into_response(),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status()).into_response()
}

fn sync_error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::FetchFailure { .. } | SyncError::WriteFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SyncError::AlreadyRunning | SyncError::Busy => StatusCode::CONFLICT,
        SyncError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::InvalidSchedule { .. } => StatusCode::BAD_REQUEST,
    }
}

fn reject_blank_names(records: &[PlanetRecord]) -> Option<Response> {
    let blank = records.iter().filter(|r| r.name.trim().is_empty()).count();
    (blank > 0).then(|| {
        error_body(
            StatusCode::BAD_REQUEST,
            format!("{blank} planet(s) without a name"),
        )
    })
}

fn not_found(name: &str) -> Response {
    error_body(StatusCode::NOT_FOUND, format!("planet {name:?} not found"))
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store operation failed");
    let status = match err {
        StoreError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.to_string())
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
