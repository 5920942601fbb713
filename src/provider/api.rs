//! Remote approval service provider.
//!
//! Talks to a generic HTTP approval service: the ask is created with a
//! `POST`, its status is polled with a `GET`, and a best-effort `POST`
//! withdraws it. The service routes the ask to whatever surface the
//! configured platform denotes; that wire format is the service's
//! business, not ours.
//!
//! ## Security
//!
//! - The API key is never logged and is redacted from `Debug` output
//! - All calls carry a request timeout and handle HTTP 429 backpressure

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    Decision, HumanLoopProvider, ProviderAsk, ProviderError, ProviderResolution, Receipt,
};
use crate::request::RequestKind;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the remote approval service.
#[derive(Clone)]
pub struct ApiConfig {
    /// Base URL of the service, e.g. `https://approvals.example.com/api`
    pub base_url: String,
    /// Bearer token for the service (never log this value)
    api_key: String,
    /// Platform hint forwarded with every ask (e.g. a chat workspace id)
    pub default_platform: Option<String>,
    /// Request timeout for service calls
    pub api_timeout: Duration,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("default_platform", &self.default_platform)
            .field("api_timeout", &self.api_timeout)
            .finish()
    }
}

impl ApiConfig {
    /// Creates a configuration for the given service and credentials.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_platform: None,
            api_timeout: Duration::from_secs(10),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HUMANLOOP_API_BASE_URL` (required) - service base URL
    /// - `HUMANLOOP_API_KEY` (required) - bearer token
    /// - `HUMANLOOP_API_PLATFORM` - platform hint forwarded with each ask
    pub fn from_env() -> Result<Self, ProviderError> {
        let base_url =
            std::env::var("HUMANLOOP_API_BASE_URL").map_err(|_| ProviderError::Unavailable {
                reason: "HUMANLOOP_API_BASE_URL is not set".to_string(),
                retriable: false,
            })?;
        let api_key =
            std::env::var("HUMANLOOP_API_KEY").map_err(|_| ProviderError::InvalidCredentials)?;

        let mut config = Self::new(base_url, api_key);
        config.default_platform = std::env::var("HUMANLOOP_API_PLATFORM").ok();
        Ok(config)
    }

    /// Sets the platform hint.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.default_platform = Some(platform.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }
}

// ============================================================================
// API Provider
// ============================================================================

/// Channel provider backed by a remote HTTP approval service.
pub struct ApiProvider {
    name: String,
    client: Client,
    config: ApiConfig,
}

impl ApiProvider {
    /// Creates a provider with the given registry name and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the HTTP client cannot be
    /// built.
    pub fn new(name: impl Into<String>, config: ApiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.api_timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
                retriable: false,
            })?;

        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    fn requests_url(&self) -> String {
        format!("{}/v1/requests", self.config.base_url)
    }

    fn request_url(&self, external_id: &str) -> String {
        format!("{}/v1/requests/{external_id}", self.config.base_url)
    }

    /// Maps a service error code onto a provider error.
    fn map_api_error(error: &str, external_id: Option<&str>, polling: bool) -> ProviderError {
        match error {
            "unauthorized" | "invalid_api_key" | "token_expired" => {
                ProviderError::InvalidCredentials
            }
            "request_not_found" => ProviderError::UnknownReceipt {
                external_id: external_id.unwrap_or("unknown").to_string(),
            },
            "rate_limited" => ProviderError::RateLimited {
                retry_after: Duration::from_secs(60),
            },
            other if polling => ProviderError::PollFailed {
                reason: other.to_string(),
                retriable: false,
            },
            other => ProviderError::Unavailable {
                reason: other.to_string(),
                retriable: false,
            },
        }
    }

    /// Handles an HTTP 429 response.
    fn handle_rate_limit(response: &reqwest::Response) -> ProviderError {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        ProviderError::RateLimited {
            retry_after: Duration::from_secs(retry_after),
        }
    }

    /// Parses a reported status string into a resolution, `None` while
    /// the ask is still pending.
    fn parse_status(body: StatusResponse) -> Option<ProviderResolution> {
        let decision = match body.status.as_deref() {
            Some("approved") => Decision::Approved,
            Some("rejected") => Decision::Rejected,
            Some("completed") => Decision::Completed,
            _ => return None,
        };
        let mut resolution = ProviderResolution::new(decision, body.response);
        resolution.responded_by = body.responded_by;
        resolution.responded_at = body.responded_at.unwrap_or_else(Utc::now);
        Some(resolution)
    }
}

#[async_trait]
impl HumanLoopProvider for ApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _kind: RequestKind) -> bool {
        true
    }

    async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError> {
        let response = self
            .client
            .post(self.requests_url())
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "request_id": ask.request_id,
                "task_id": ask.task_id,
                "kind": ask.kind,
                "conversation_id": ask.conversation_id,
                "platform": self.config.default_platform,
                "metadata": ask.metadata,
                "history": ask.history,
                "expires_at": ask.expires_at,
            }))
            .send()
            .await
            .map_err(|e| {
                error!(request_id = %ask.request_id, error = %e, "failed to deliver ask to approval service");
                ProviderError::Unavailable {
                    reason: e.to_string(),
                    retriable: e.is_connect() || e.is_timeout(),
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::handle_rate_limit(&response));
        }

        let body: CreateResponse = response.json().await.map_err(|e| ProviderError::Unavailable {
            reason: format!("failed to parse service response: {e}"),
            retriable: false,
        })?;

        if !body.success {
            let error = body.error.as_deref().unwrap_or("unknown");
            return Err(Self::map_api_error(error, None, false));
        }

        let external_id = body
            .request_ref
            .unwrap_or_else(|| ask.request_id.to_string());

        info!(
            request_id = %ask.request_id,
            external_id = %external_id,
            "delivered ask to approval service"
        );

        Ok(Receipt {
            request_id: ask.request_id.clone(),
            external_id,
            issued_at: Utc::now(),
        })
    }

    async fn poll(&self, receipt: &Receipt) -> Result<Option<ProviderResolution>, ProviderError> {
        let response = self
            .client
            .get(self.request_url(&receipt.external_id))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::PollFailed {
                reason: e.to_string(),
                retriable: true,
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::handle_rate_limit(&response));
        }

        let body: StatusResponse =
            response.json().await.map_err(|e| ProviderError::PollFailed {
                reason: format!("failed to parse status response: {e}"),
                retriable: true,
            })?;

        if !body.success {
            let error = body.error.as_deref().unwrap_or("unknown");
            return Err(Self::map_api_error(
                error,
                Some(&receipt.external_id),
                true,
            ));
        }

        match Self::parse_status(body) {
            Some(resolution) => {
                info!(
                    request_id = %receipt.request_id,
                    decision = ?resolution.decision,
                    "approval service reported a decision"
                );
                Ok(Some(resolution))
            }
            None => {
                debug!(request_id = %receipt.request_id, "no decision yet");
                Ok(None)
            }
        }
    }

    async fn cancel(&self, receipt: &Receipt) -> Result<(), ProviderError> {
        let result = self
            .client
            .post(format!("{}/cancel", self.request_url(&receipt.external_id)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(request_id = %receipt.request_id, "withdrew ask from approval service");
            }
            Ok(response) => {
                warn!(
                    request_id = %receipt.request_id,
                    status = %response.status(),
                    "failed to withdraw ask"
                );
            }
            Err(e) => {
                warn!(request_id = %receipt.request_id, error = %e, "failed to withdraw ask");
            }
        }

        Ok(())
    }
}

// ============================================================================
// Service Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateResponse {
    success: bool,
    error: Option<String>,
    request_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    success: bool,
    error: Option<String>,
    status: Option<String>,
    response: Option<serde_json::Value>,
    responded_by: Option<String>,
    responded_at: Option<chrono::DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
