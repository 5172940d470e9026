use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use hivewatch_core::{
    Aggregate, ReadingFlag, SensorId, StoredReading,
    duration::{HumanDuration, format_duration},
};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::query::{QueryResult, QueryRows, QueryServiceError};

use super::ApiState;

/// Query parameters for the readings endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadingsQuery {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Bucket width such as `1h`; picks the tier and merges buckets.
    pub interval: Option<HumanDuration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingResponse {
    pub timestamp: Timestamp,
    pub value: f64,
    pub flag: ReadingFlag,
}

impl From<&StoredReading> for ReadingResponse {
    fn from(stored: &StoredReading) -> Self {
        Self {
            timestamp: stored.reading.timestamp,
            value: stored.reading.value(),
            flag: stored.flag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

impl From<&Aggregate> for AggregateResponse {
    fn from(a: &Aggregate) -> Self {
        Self {
            bucket_start: a.bucket_start,
            bucket_end: a.bucket_end,
            min: a.min.into_inner(),
            max: a.max.into_inner(),
            avg: a.avg.into_inner(),
            count: a.count,
        }
    }
}

/// Response body for a readings query. Exactly one of `readings` and
/// `aggregates` is filled, depending on the tier that served it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingsResponse {
    pub sensor_id: String,
    pub tier: String,
    /// Bucket width of the rows, absent for raw readings.
    pub interval: Option<String>,
    #[serde(default)]
    pub readings: Vec<ReadingResponse>,
    #[serde(default)]
    pub aggregates: Vec<AggregateResponse>,
}

impl From<QueryResult> for ReadingsResponse {
    fn from(result: QueryResult) -> Self {
        let (readings, aggregates) = match &result.rows {
            QueryRows::Readings(rows) => (rows.iter().map(ReadingResponse::from).collect(), vec![]),
            QueryRows::Aggregates(rows) => {
                (vec![], rows.iter().map(AggregateResponse::from).collect())
            }
        };
        Self {
            sensor_id: result.sensor_id.0.to_string(),
            tier: result.tier.to_string(),
            interval: result.interval.map(format_duration),
            readings,
            aggregates,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestResponse {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: Timestamp,
    pub stale: bool,
}

fn parse_sensor_id(id: &str) -> Option<SensorId> {
    id.parse::<Ulid>().ok().map(SensorId)
}

/// Readings or aggregates for a sensor over a time range.
///
/// GET /api/sensors/{id}/readings?start=..&end=..&interval=..
pub async fn readings(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> impl IntoResponse {
    let Some(sensor) = parse_sensor_id(&id) else {
        return (StatusCode::BAD_REQUEST, "Invalid sensor ID").into_response();
    };

    let result = state
        .query
        .query(
            sensor,
            params.start,
            params.end,
            params.interval.map(|i| i.get()),
            Timestamp::now(),
        )
        .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(ReadingsResponse::from(result))).into_response(),
        Err(QueryServiceError::Invalid(e)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(QueryServiceError::UnknownSensor(_)) => {
            (StatusCode::NOT_FOUND, "Sensor not found").into_response()
        }
        Err(e) => {
            tracing::error!(error = ?e, %sensor, "Failed to query readings");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to query readings").into_response()
        }
    }
}

/// Latest value of a sensor.
///
/// GET /api/sensors/{id}/latest
pub async fn latest(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(sensor) = parse_sensor_id(&id) else {
        return (StatusCode::BAD_REQUEST, "Invalid sensor ID").into_response();
    };

    match state
        .cache
        .get_or_load(sensor, state.store.as_ref(), Timestamp::now())
        .await
    {
        Ok(Some(last)) => (
            StatusCode::OK,
            Json(LatestResponse {
                sensor_id: sensor.0.to_string(),
                value: last.value,
                timestamp: last.timestamp,
                stale: last.stale,
            }),
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "No readings for sensor").into_response(),
        Err(e) => {
            tracing::error!(error = ?e, %sensor, "Failed to load latest reading");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load latest reading").into_response()
        }
    }
}
