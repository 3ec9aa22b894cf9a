use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::types::{DeviceSetDelta, PresenceRecord};
use tokio::sync::watch;

use crate::normalize::normalize_mac;
use crate::store_manager::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Deserialize)]
pub struct DeviceQuery {
    /// When set, only records whose `present` flag matches are returned.
    pub present: Option<bool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices", get(get_devices))
        .route("/v1/devices/hash", get(get_hash))
        .route("/v1/devices/:mac", get(get_device).delete(delete_device))
        .route("/v1/delta", get(get_delta))
        .with_state(state)
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Result<Json<Vec<PresenceRecord>>, StatusCode> {
    let mut records = state.store.get_all().await.map_err(|e| {
        tracing::error!("Failed to query devices: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if let Some(present) = params.present {
        records.retain(|r| r.present == present);
    }

    Ok(Json(records))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<PresenceRecord>, StatusCode> {
    state
        .store
        .get_one(normalize_mac(&mac))
        .await
        .map_err(|e| {
            tracing::error!("Failed to query device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// The explicit downstream removal act: drops the record outright instead of
/// waiting for the device to reappear.
async fn delete_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> StatusCode {
    match state.store.remove(normalize_mac(&mac)).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to remove device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_delta(State(state): State<AppState>) -> Result<Json<DeviceSetDelta>, StatusCode> {
    state
        .store
        .delta()
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to query delta: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
