//! HTTP operational surface: `/health`, `/stats`, `/metrics`.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use pulse_store::SharedStore;

use crate::breaker::BreakerRegistry;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::router::MessageRouter;

/// Shared state behind the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    /// Shared store handle, probed by `/health`.
    pub store: Arc<dyn SharedStore>,
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Room manager.
    pub rooms: Arc<RoomManager>,
    /// Message router, for offline-queue depths.
    pub router: Arc<MessageRouter>,
    /// Circuit breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// Process start time.
    pub started: Instant,
}

/// Build the operational router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health payload and whether the process is fully healthy.
pub async fn health_snapshot(state: &AppState) -> (bool, Value) {
    let store_up = state.store.ping().await.is_ok();
    let payload = json!({
        "status": if store_up { "ok" } else { "degraded" },
        "store": if store_up { "up" } else { "down" },
        "uptimeSecs": state.started.elapsed().as_secs(),
    });
    (store_up, payload)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, payload) = health_snapshot(&state).await;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(payload))
}

/// Stats payload: connections, rooms, queue depths, breakers.
pub async fn stats_snapshot(state: &AppState) -> Value {
    let connections = state.registry.stats().await.ok();
    let rooms = state.rooms.room_stats().await.unwrap_or_default();
    let ids = state.registry.connection_ids().await.unwrap_or_default();
    let queue_depths = state.router.queue_depths(&ids).await;
    json!({
        "connections": connections,
        "rooms": rooms,
        "queueDepths": queue_depths,
        "breakers": state.breakers.snapshots(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(stats_snapshot(&state).await)
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
