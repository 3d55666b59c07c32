use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Credential;
use crate::error::{ConfigError, RefreshError};

/// Identifying fields sent to the refresh endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshRequest<'a> {
    /// Principal whose credential is refreshed
    pub principal_id: &'a str,
    /// Tenant the credential is scoped to, if any
    pub tenant_id: Option<&'a str>,
}

/// A successful refresh response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedCredential {
    /// The new credential
    pub credential: Credential,
    /// When the new credential must next be refreshed
    #[serde(with = "chrono::serde::ts_seconds")]
    pub next_refresh_at: DateTime<Utc>,
}

/// Performs the outbound credential refresh call.
///
/// Implementations must bound the call with a timeout and must not retry.
pub trait RefreshClient: Send + Sync {
    /// Requests a new credential.
    fn refresh(&self, request: &RefreshRequest<'_>) -> Result<RefreshedCredential, RefreshError>;
}

/// Refresh client that POSTs JSON to an HTTP endpoint.
///
/// The request body is `{"principal_id": ..., "tenant_id": ...}`; a 2xx
/// response must carry `{"credential": "...", "next_refresh_at": <unix secs>}`.
/// Any other status or shape is a [`RefreshError`].
#[derive(Debug, Clone)]
pub struct HttpRefreshClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpRefreshClient {
    /// Creates a client for `endpoint` with a per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| ConfigError::InvalidValue {
                key: "refresh_endpoint",
                reason: err.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Returns the configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn transport_error(err: reqwest::Error) -> RefreshError {
    if err.is_timeout() {
        RefreshError::Timeout
    } else {
        RefreshError::Transport(err.to_string())
    }
}

impl RefreshClient for HttpRefreshClient {
    fn refresh(&self, request: &RefreshRequest<'_>) -> Result<RefreshedCredential, RefreshError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Status(status.as_u16()));
        }

        let body = response.text().map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|err| RefreshError::MalformedResponse(err.to_string()))
    }
}
