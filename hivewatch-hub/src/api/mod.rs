pub mod hives;
pub mod retention;
pub mod sensors;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::cache::LastValueCache;
use crate::cleanup::HiveCleanup;
use crate::query::QueryService;
use crate::retention::RetentionReloader;
use crate::store::TimeSeriesStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub query: Arc<QueryService>,
    pub store: Arc<dyn TimeSeriesStore>,
    pub cache: Arc<LastValueCache>,
    pub reloader: Arc<RetentionReloader>,
    pub cleanup: Arc<HiveCleanup>,
}

/// Create the full API router with all endpoints.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sensors/{id}/readings", get(sensors::readings))
        .route("/api/sensors/{id}/latest", get(sensors::latest))
        .route("/api/retention", get(retention::get_retention))
        .route("/api/retention/reload", post(retention::reload_retention))
        .route("/api/hives/{id}", delete(hives::delete_hive))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
