use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::BackendConfig;
use crate::error::{RealtimeError, Result};

use super::session::UserProfile;
use super::{Credential, TokenProvider};

/// Wire shape of `GET /anonymous-token`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    token_material: String,
    client_id: String,
}

/// Wire shape of `POST /token`.
///
/// Carries the API access token for backend calls, the user profile, and
/// fresh realtime token material bound to the authenticated identity. The
/// material is meant to be forwarded to credential renewal so the live
/// connection is upgraded in place.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_info: UserProfile,
    pub token_material: String,
}

/// Credential provider backed by the dashboard's REST API.
pub struct RestTokenProvider {
    http: reqwest::Client,
    base_url: String,
}

impl RestTokenProvider {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Exchange username/password for an API token, profile and realtime
    /// token material.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let response = self
            .http
            .post(self.url("token"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RealtimeError::Auth(
                "Incorrect username or password".to_string(),
            ));
        }

        let login: LoginResponse = response.error_for_status()?.json().await?;

        tracing::info!(username = %login.user_info.username, "Login succeeded");

        Ok(login)
    }

    /// Validate a restored access token against the backend.
    pub async fn me(&self, access_token: &str) -> Result<UserProfile> {
        let response = self
            .http
            .get(self.url("users/me"))
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RealtimeError::Auth("Session expired".to_string()));
        }

        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl TokenProvider for RestTokenProvider {
    async fn fetch_token(&self) -> Result<Credential> {
        let grant: TokenGrant = self
            .http
            .get(self.url("anonymous-token"))
            .send()
            .await
            .map_err(|e| RealtimeError::Auth(format!("Token endpoint unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| RealtimeError::Auth(format!("Token request rejected: {}", e)))?
            .json()
            .await
            .map_err(|e| RealtimeError::Auth(format!("Malformed token payload: {}", e)))?;

        tracing::debug!(client_id = %grant.client_id, "Fetched anonymous token");

        Ok(Credential {
            material: grant.token_material,
            client_id: grant.client_id,
        })
    }
}
