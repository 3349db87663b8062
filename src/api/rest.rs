use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::services::{DedupeStore, PollStats};

/// Most keys returned by `/seen`.
const SEEN_LIMIT: usize = 200;

pub struct AppState {
    pub store: Arc<dyn DedupeStore>,
    pub stats: PollStats,
    pub watchers: Vec<String>,
}

/// GET /health
async fn health() -> &'static str {
    "OK"
}

/// GET /stats - per-watcher counters and store size
async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(stats_body(&state))
}

/// GET /seen - tracked entity keys (first 200)
async fn seen(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(seen_body(state.store.as_ref()))
}

fn stats_body(state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "tracked_entities": state.store.len(),
        "watchers": state.watchers,
        "pollers": state.stats.snapshot(),
    })
}

fn seen_body(store: &dyn DedupeStore) -> serde_json::Value {
    let keys = store.all_keys();
    let total = keys.len();
    let shown: Vec<String> = keys.into_iter().take(SEEN_LIMIT).collect();
    serde_json::json!({ "total": total, "keys": shown })
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/seen", get(seen))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
