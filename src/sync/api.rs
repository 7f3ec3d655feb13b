//! Sync API Client - HTTP communication with the SGM REST API
//!
//! The remote API is the authority for orders and calls. The engine only
//! needs two things from it:
//! - read the current record (to compare its `updated_at` with a baseline)
//! - apply an update (`PUT`/`POST` to the record path or an override path)
//!
//! Responses use the envelope `{ success, data?, error?, message? }`.

use super::models::{HttpMethod, ReferenceType, RemoteRequest, SyncConfig};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Remote authority consumed by the coordinator
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Current server copy of an order or call
    async fn fetch_record(
        &self,
        reference_type: ReferenceType,
        id: i64,
    ) -> Result<serde_json::Value, SyncApiError>;

    /// Apply a mutation's request
    async fn apply(&self, request: &RemoteRequest) -> Result<(), SyncApiError>;
}

/// API client for the SGM server
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    /// Bearer token supplied by the host application
    access_token: Arc<RwLock<Option<String>>>,
}

impl SyncApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncApiError> {
        Self::new(
            config.api_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.get_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET a path and unwrap the envelope's `data`
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, SyncApiError> {
        let request = self.authorized(self.client.get(self.url(path))).await;
        let response = request.send().await?;

        let envelope: ApiEnvelope = handle_response(response).await?;
        if !envelope.success {
            return Err(SyncApiError::Rejected(envelope.error_message()));
        }
        envelope.data.ok_or(SyncApiError::InvalidResponse)
    }

    /// Send a JSON body with the given method
    pub async fn send_json(
        &self,
        method: HttpMethod,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), SyncApiError> {
        let builder = match method {
            HttpMethod::Put => self.client.put(self.url(path)),
            HttpMethod::Post => self.client.post(self.url(path)),
        };
        let response = self.authorized(builder).await.json(body).send().await?;

        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }

        // Some endpoints answer with an empty body; only an explicit
        // `success: false` counts as a rejection.
        let text = response.text().await?;
        if let Ok(envelope) = serde_json::from_str::<ApiEnvelope>(&text) {
            if !envelope.success {
                return Err(SyncApiError::Rejected(envelope.error_message()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAuthority for SyncApiClient {
    async fn fetch_record(
        &self,
        reference_type: ReferenceType,
        id: i64,
    ) -> Result<serde_json::Value, SyncApiError> {
        self.get_json(&reference_type.record_path(id)).await
    }

    async fn apply(&self, request: &RemoteRequest) -> Result<(), SyncApiError> {
        log::debug!("{:?} {}", request.method, request.path);
        self.send_json(request.method, &request.path, &request.body).await
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct ApiEnvelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl ApiEnvelope {
    fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request rejected ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiEnvelope>(&body)
        .ok()
        .and_then(|envelope| envelope.error.or(envelope.message))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            } else {
                body
            }
        });

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::NOT_FOUND => SyncApiError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => SyncApiError::ServerError(message),
        s => SyncApiError::ClientError {
            status: s.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
