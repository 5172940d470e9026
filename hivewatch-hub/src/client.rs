use hivewatch_core::duration::format_duration;
use jiff::{SignedDuration, Timestamp};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use thiserror::Error;
use ulid::Ulid;

use crate::api::{
    hives::CleanupFailure,
    retention::RetentionResponse,
    sensors::{LatestResponse, ReadingsResponse},
};
use crate::cleanup::CleanupReport;

/// Error type for API client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned error status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Resource not found")]
    NotFound,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Hive cleanup stopped at `{}`: {}", .0.failed_step, .0.message)]
    CleanupFailed(CleanupFailure),
}

/// HTTP API client for the hub.
#[derive(Clone)]
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    /// Create a new API client with the given base URL.
    ///
    /// # Example
    /// ```no_run
    /// use hivewatch_hub::client::Client;
    ///
    /// let client = Client::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a new API client with a custom reqwest client.
    pub fn with_http_client(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Readings of a sensor over `[start, end)`, optionally bucketed.
    pub async fn readings(
        &self,
        sensor: Ulid,
        start: Timestamp,
        end: Timestamp,
        interval: Option<SignedDuration>,
    ) -> Result<ReadingsResponse, ClientError> {
        let url = format!("{}/api/sensors/{}/readings", self.base_url, sensor);

        let mut query = vec![("start", start.to_string()), ("end", end.to_string())];
        if let Some(interval) = interval {
            query.push(("interval", format_duration(interval)));
        }

        let response = self.http.get(&url).query(&query).send().await?;

        handle_response(response).await
    }

    /// Latest value of a sensor.
    pub async fn latest(&self, sensor: Ulid) -> Result<LatestResponse, ClientError> {
        let url = format!("{}/api/sensors/{}/latest", self.base_url, sensor);

        let response = self.http.get(&url).send().await?;

        handle_response(response).await
    }

    /// The retention table the hub is running with.
    pub async fn retention(&self) -> Result<RetentionResponse, ClientError> {
        let url = format!("{}/api/retention", self.base_url);

        let response = self.http.get(&url).send().await?;

        handle_response(response).await
    }

    /// Ask the hub to re-read its retention tiers.
    pub async fn reload_retention(&self) -> Result<RetentionResponse, ClientError> {
        let url = format!("{}/api/retention/reload", self.base_url);

        let response = self.http.post(&url).send().await?;

        handle_response(response).await
    }

    /// Delete a hive with everything attached to it.
    ///
    /// A cleanup that stops part way returns [`ClientError::CleanupFailed`]
    /// with the steps that did complete.
    pub async fn delete_hive(&self, hive: Ulid) -> Result<CleanupReport, ClientError> {
        let url = format!("{}/api/hives/{}", self.base_url, hive);

        let response = self.http.delete(&url).send().await?;

        if response.status() == reqwest::StatusCode::INTERNAL_SERVER_ERROR {
            let body = response.text().await?;
            return match serde_json::from_str::<CleanupFailure>(&body) {
                Ok(failure) => Err(ClientError::CleanupFailed(failure)),
                Err(_) => Err(ClientError::ServerError {
                    status: 500,
                    message: body,
                }),
            };
        }

        handle_response(response).await
    }
}

async fn handle_response<T>(response: reqwest::Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let status = response.status();

    if status.is_success() {
        Ok(response.json().await?)
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(ClientError::NotFound)
    } else if status == reqwest::StatusCode::BAD_REQUEST {
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::BadRequest(message))
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::ServerError {
            status: status.as_u16(),
            message,
        })
    }
}
