use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use hivewatch_core::HiveId;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::cleanup::{CleanupError, CleanupReport, CleanupStep};

use super::ApiState;

/// Body returned when a cleanup stops part way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub failed_step: CleanupStep,
    pub message: String,
    pub report: CleanupReport,
}

/// Delete a hive with its sensors, data, files and comments.
///
/// DELETE /api/hives/{id}
pub async fn delete_hive(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let ulid = match id.parse::<Ulid>() {
        Ok(ulid) => ulid,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid hive ID").into_response(),
    };

    match state.cleanup.delete_hive(HiveId(ulid)).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(CleanupError::NotFound(_)) => (StatusCode::NOT_FOUND, "Hive not found").into_response(),
        Err(CleanupError::StepFailed {
            step,
            message,
            report,
        }) => {
            tracing::error!(hive = %ulid, %step, %message, "Hive cleanup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CleanupFailure {
                    failed_step: step,
                    message,
                    report,
                }),
            )
                .into_response()
        }
    }
}
