//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::server::AppState;
use crate::channel::{ChannelId, Lifecycle};
use crate::dispatch::{RouteTarget, RoutingEntry};
use crate::error::DispatchError;
use crate::relay::RelaySnapshot;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// System status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub mode: String,
    pub uptime_seconds: u64,
    /// Channels that have accepted at least one sample
    pub live_channels: usize,
    /// Channels past warm-up
    pub active_channels: usize,
    pub lane_count: usize,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let snap = state.hub.snapshot();
    let status = SystemStatus {
        mode: "relay".to_string(),
        uptime_seconds: snap.uptime_secs,
        live_channels: snap.channels.iter().filter(|c| c.samples_accepted > 0).count(),
        active_channels: snap
            .channels
            .iter()
            .filter(|c| c.lifecycle == Lifecycle::Active)
            .count(),
        lane_count: snap.dispatch.lanes.len(),
    };

    Json(ApiResponse::ok(status))
}

/// Get every counter
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<RelaySnapshot>> {
    Json(ApiResponse::ok(state.hub.snapshot()))
}

/// Get the routing table
pub async fn get_routing(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<RoutingEntry>>> {
    Json(ApiResponse::ok(state.hub.dispatcher().routing().entries()))
}

/// Replace one channel's route
pub async fn update_route(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<u8>,
    Json(target): Json<RouteTarget>,
) -> (StatusCode, Json<ApiResponse<RoutingEntry>>) {
    let Some(channel) = ChannelId::new(channel) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(DispatchError::UnknownChannel(channel).to_string())),
        );
    };

    match state.hub.dispatcher().update_route(channel, target) {
        Ok(()) => {
            let entry = RoutingEntry {
                channel,
                bank: target.bank,
                pan: target.pan,
            };
            (StatusCode::OK, Json(ApiResponse::ok(entry)))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string()))),
    }
}
