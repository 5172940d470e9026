use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use hivewatch_core::retention::TierConfig;
use serde::{Deserialize, Serialize};

use crate::retention::ReloadError;

use super::ApiState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionResponse {
    pub tiers: Vec<TierConfig>,
}

/// The retention table in effect.
///
/// GET /api/retention
pub async fn get_retention(State(state): State<ApiState>) -> impl IntoResponse {
    let tiers = state.reloader.handle().configs().to_vec();
    (StatusCode::OK, Json(RetentionResponse { tiers }))
}

/// Re-read retention tiers from the config file.
///
/// POST /api/retention/reload
pub async fn reload_retention(State(state): State<ApiState>) -> impl IntoResponse {
    match state.reloader.reload().await {
        Ok(tiers) => (
            StatusCode::OK,
            Json(RetentionResponse {
                tiers: tiers.to_vec(),
            }),
        )
            .into_response(),
        Err(e @ (ReloadError::Invalid(_) | ReloadError::Config(_))) => {
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
        }
        Err(ReloadError::NoConfigFile) => {
            (StatusCode::CONFLICT, "Hub was started without a config file").into_response()
        }
        Err(e @ ReloadError::TierChanged(_)) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(error = ?e, "Failed to reload retention table");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to reload retention table").into_response()
        }
    }
}
