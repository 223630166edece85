//! OAuth token management for the vehicle cloud API
//!
//! Access tokens are short lived; the refresh token from the one-time pairing
//! flow is exchanged for a fresh access token whenever the API reports the
//! current one expired.

use crate::config::AuthConfig;
use crate::error::{Result, VehicleError};
use crate::logging::get_logger;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

/// Source of bearer tokens for authenticated API calls
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token, refreshing first if none is held yet
    async fn current_token(&self) -> Result<String>;

    /// Force a refresh, discarding any cached token
    async fn refresh(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Refresh-token grant against the vendor OAuth endpoint
pub struct RefreshTokenSource {
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    http: reqwest::Client,
    cached: Mutex<Option<String>>,
    logger: crate::logging::StructuredLogger,
}

impl RefreshTokenSource {
    pub fn new(auth: &AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            token_url: auth.token_url.clone(),
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            refresh_token: auth.refresh_token.clone(),
            http,
            cached: Mutex::new(None),
            logger: get_logger("token"),
        })
    }

    async fn exchange(&self) -> Result<String> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VehicleError::timeout(format!("token exchange timed out: {}", e))
                } else {
                    VehicleError::unreachable(format!("token endpoint unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VehicleError::auth_expired(format!(
                "token exchange failed with status {}",
                status
            ))
            .into());
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| VehicleError::api(format!("malformed token response: {}", e)))?;

        self.logger.info(&format!(
            "access token refreshed (expires_in={:?}s)",
            body.expires_in
        ));
        Ok(body.access_token)
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn current_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.exchange().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String> {
        let token = self.exchange().await?;
        let mut cached = self.cached.lock().await;
        *cached = Some(token.clone());
        Ok(token)
    }
}

/// Fixed token for tests and local development
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn current_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
