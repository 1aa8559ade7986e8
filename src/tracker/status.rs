//! Read-only HTTP status API
//!
//! - `GET /api/status`: current song, counters, member count
//! - `GET /api/peers`: members and their advertised songs
//! - `GET /api/queue`: pending songs, head first

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::error::NetworkError;
use crate::tracker::server::SharedTrackerState;
use crate::tracker::state::{PeerRecord, TrackerSnapshot};

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
}

/// Tracker status
#[derive(serde::Serialize)]
pub struct TrackerStatus {
    #[serde(flatten)]
    pub snapshot: TrackerSnapshot,
    pub uptime_seconds: u64,
}

struct StatusState {
    tracker: SharedTrackerState,
    start_time: Instant,
}

/// Build the status router over the tracker's shared state
pub fn router(tracker: SharedTrackerState) -> Router {
    let state = Arc::new(StatusState {
        tracker,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/peers", get(get_peers))
        .route("/api/queue", get(get_queue))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the status API until the listener fails
pub async fn serve(addr: SocketAddr, tracker: SharedTrackerState) -> Result<(), NetworkError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    tracing::info!("Status API listening on http://{}", addr);

    axum::serve(listener, router(tracker))
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))
}

/// Get tracker status
async fn get_status(State(state): State<Arc<StatusState>>) -> Json<ApiResponse<TrackerStatus>> {
    let snapshot = state.tracker.lock().snapshot();
    Json(ApiResponse::ok(TrackerStatus {
        snapshot,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    }))
}

/// Get members
async fn get_peers(State(state): State<Arc<StatusState>>) -> Json<ApiResponse<Vec<PeerRecord>>> {
    let peers = state.tracker.lock().peers().to_vec();
    Json(ApiResponse::ok(peers))
}

/// Get the song queue
async fn get_queue(State(state): State<Arc<StatusState>>) -> Json<ApiResponse<Vec<String>>> {
    let queue = state.tracker.lock().queue();
    Json(ApiResponse::ok(queue))
}
