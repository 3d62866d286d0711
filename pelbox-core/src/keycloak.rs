//! Identity provider REST client
//!
//! Only three endpoints of the Keycloak contract matter to the box:
//! - the admin realm token endpoint (service login and refresh)
//! - the member realm sessions of a user
//! - the member realm user search by username
//!
//! `IdentityProvider` is the seam the session authority talks through, so
//! tests can script the provider without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::IdentityConfig;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The bearer credential on an admin call was not accepted
    #[error("Service credential rejected")]
    Unauthorized,

    /// The token endpoint refused the grant (HTTP 400)
    #[error("Grant rejected: {0}")]
    GrantRejected(String),

    #[error("Provider returned HTTP {status}: {context}")]
    ServerError { status: u16, context: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Grant sent to the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Service login with the client secret
    ClientCredentials,
    RefreshToken(String),
}

impl Grant {
    pub fn kind(&self) -> &'static str {
        match self {
            Grant::ClientCredentials => "client_credentials",
            Grant::RefreshToken(_) => "refresh_token",
        }
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Not every provider configuration issues refresh tokens for the
    /// client credentials grant
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// One active session of a member
#[derive(Debug, Clone, Deserialize)]
pub struct UserSession {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "lastAccess", default)]
    pub last_access: Option<i64>,
}

/// Member as listed by the users endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a grant for service tokens
    async fn exchange(&self, grant: &Grant) -> Result<TokenResponse, ProviderError>;

    /// Active sessions of `subject`, authorized by the service `access_token`
    async fn user_sessions(
        &self,
        access_token: &str,
        subject: &str,
    ) -> Result<Vec<UserSession>, ProviderError>;

    /// Users matching `username` exactly
    async fn find_users(
        &self,
        access_token: &str,
        username: &str,
    ) -> Result<Vec<UserRecord>, ProviderError>;
}

/// Keycloak admin REST client
pub struct KeycloakClient {
    client: Client,
    base_url: String,
    realm: String,
    admin_realm: String,
    client_id: String,
    client_secret: String,
}

impl KeycloakClient {
    pub fn new(config: &IdentityConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            realm: config.realm.clone(),
            admin_realm: config.admin_realm.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url, self.admin_realm
        )
    }

    fn users_url(&self) -> String {
        format!("{}/admin/realms/{}/users", self.base_url, self.realm)
    }

    fn check_admin_status(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::UNAUTHORIZED => Err(ProviderError::Unauthorized),
            s => Err(ProviderError::ServerError {
                status: s.as_u16(),
                context: context.to_string(),
            }),
        }
    }
}

/// Keycloak error body on the token endpoint
#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl IdentityProvider for KeycloakClient {
    async fn exchange(&self, grant: &Grant) -> Result<TokenResponse, ProviderError> {
        let mut form = vec![
            ("grant_type", grant.kind()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Grant::RefreshToken(token) = grant {
            form.push(("refresh_token", token.as_str()));
        }

        let resp = self.client.post(self.token_url()).form(&form).send().await?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<TokenResponse>()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string())),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                let reason = match resp.json::<OAuthError>().await {
                    Ok(body) => body.error_description.unwrap_or(body.error),
                    Err(_) => "no error description".to_string(),
                };
                Err(ProviderError::GrantRejected(reason))
            }
            s => Err(ProviderError::ServerError {
                status: s.as_u16(),
                context: format!("{} grant", grant.kind()),
            }),
        }
    }

    async fn user_sessions(
        &self,
        access_token: &str,
        subject: &str,
    ) -> Result<Vec<UserSession>, ProviderError> {
        let url = format!("{}/{}/sessions", self.users_url(), subject);
        let resp = self.client.get(url).bearer_auth(access_token).send().await?;
        let resp = Self::check_admin_status(resp, "user sessions")?;

        resp.json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn find_users(
        &self,
        access_token: &str,
        username: &str,
    ) -> Result<Vec<UserRecord>, ProviderError> {
        let resp = self
            .client
            .get(self.users_url())
            .query(&[("username", username), ("exact", "true")])
            .bearer_auth(access_token)
            .send()
            .await?;
        let resp = Self::check_admin_status(resp, "user search")?;

        resp.json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}
