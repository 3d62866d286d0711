//! Session authority for pelbox commands
//!
//! Holds one service credential against the identity provider and answers
//! whether a member's access token is backed by an active session.
//!
//! Refresh is purely reactive: when a session check reports the service credential
//! as unauthorized, the authority refreshes once and retries the check once.
//! A rejected refresh token falls back to a full service login. If that
//! login fails too, the authority stays unusable until restarted.
//!
//! Member tokens are decoded WITHOUT signature verification. This is only
//! acceptable while the box talks to the provider and its clients over a
//! trusted internal network; verifying against the realm's JWKS is still
//! missing and must be added before exposing the daemon anywhere else.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::keycloak::{Grant, IdentityProvider, ProviderError, TokenResponse, UserSession};

/// Claims read from a member access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id at the identity provider
    pub sub: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Malformed access token: {0}")]
    TokenMalformed(String),

    #[error("Identity provider credential is unavailable")]
    AuthorityUnavailable,

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(#[source] ProviderError),

    #[error("No user named {0} at the identity provider")]
    SubjectNotFound(String),
}

/// The authority's own provider session
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl From<TokenResponse> for Credential {
    fn from(tokens: TokenResponse) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            issued_at: Utc::now(),
        }
    }
}

/// Result of a session check
#[derive(Debug, Clone)]
pub struct SessionCheck {
    pub active: bool,
    pub claims: Claims,
}

/// Decode a member access token without checking its signature
pub fn decode_claims(token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| AuthError::TokenMalformed(e.to_string()))?;

    if data.claims.sub.is_empty() {
        return Err(AuthError::TokenMalformed("empty subject".to_string()));
    }
    Ok(data.claims)
}

/// Service-level session manager
pub struct SessionAuthority {
    provider: Arc<dyn IdentityProvider>,
    credential: RwLock<Option<Credential>>,
}

impl SessionAuthority {
    /// Create an authority with no credential. Call `initialize` before use.
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            credential: RwLock::new(None),
        }
    }

    /// Create and log in
    pub async fn connect(provider: Arc<dyn IdentityProvider>) -> Result<Self, AuthError> {
        let authority = Self::new(provider);
        authority.initialize().await?;
        Ok(authority)
    }

    /// Service login. On failure the stored credential is cleared.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        let mut guard = self.credential.write().await;
        self.login(&mut *guard).await
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    /// Check that the member token is backed by an active session
    pub async fn verify(&self, end_user_token: &str) -> Result<SessionCheck, AuthError> {
        let claims = decode_claims(end_user_token)?;
        let sessions = self.check_sessions(&claims.sub).await?;

        let active = !sessions.is_empty();
        tracing::debug!(subject = %claims.sub, sessions = sessions.len(), "session check");
        Ok(SessionCheck { active, claims })
    }

    /// Look up the provider subject id of a member
    pub async fn resolve_subject(&self, username: &str) -> Result<String, AuthError> {
        let token = self.access_token().await?;
        let users = match self.provider.find_users(&token, username).await {
            Err(ProviderError::Unauthorized) => {
                self.refresh(&token).await?;
                let token = self.access_token().await?;
                self.provider.find_users(&token, username).await
            }
            other => other,
        }
        .map_err(unavailable)?;

        users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(|u| u.id)
            .ok_or_else(|| AuthError::SubjectNotFound(username.to_string()))
    }

    /// Replace the credential using its refresh token, or log in again if
    /// the refresh token is rejected.
    ///
    /// `stale` is the access token the caller saw rejected. If another task
    /// already replaced it, this is a no-op.
    pub async fn refresh(&self, stale: &str) -> Result<(), AuthError> {
        let mut guard = self.credential.write().await;
        let refresh_token = match guard.as_ref() {
            None => return Err(AuthError::AuthorityUnavailable),
            Some(current) if current.access_token != stale => {
                tracing::debug!("service credential already refreshed by another request");
                return Ok(());
            }
            Some(current) => current.refresh_token.clone(),
        };

        let Some(refresh_token) = refresh_token else {
            tracing::info!("no service refresh token held, logging in again");
            return self.login(&mut *guard).await;
        };

        tracing::info!("service credential rejected, refreshing");
        match self.provider.exchange(&Grant::RefreshToken(refresh_token)).await {
            Ok(tokens) => {
                *guard = Some(tokens.into());
                Ok(())
            }
            Err(ProviderError::GrantRejected(reason)) => {
                tracing::warn!("service refresh token rejected ({}), logging in again", reason);
                self.login(&mut *guard).await
            }
            Err(e) => {
                tracing::error!("service credential refresh failed: {}", e);
                Err(AuthError::ProviderUnavailable(e))
            }
        }
    }

    async fn login(&self, slot: &mut Option<Credential>) -> Result<(), AuthError> {
        match self.provider.exchange(&Grant::ClientCredentials).await {
            Ok(tokens) => {
                tracing::info!("logged in to identity provider as service client");
                *slot = Some(tokens.into());
                Ok(())
            }
            Err(e) => {
                tracing::error!("service login to identity provider failed: {}", e);
                *slot = None;
                Err(AuthError::AuthorityUnavailable)
            }
        }
    }

    async fn access_token(&self) -> Result<String, AuthError> {
        self.credential
            .read()
            .await
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or(AuthError::AuthorityUnavailable)
    }

    async fn check_sessions(&self, subject: &str) -> Result<Vec<UserSession>, AuthError> {
        let token = self.access_token().await?;
        let sessions = match self.provider.user_sessions(&token, subject).await {
            Err(ProviderError::Unauthorized) => {
                self.refresh(&token).await?;
                let token = self.access_token().await?;
                self.provider.user_sessions(&token, subject).await
            }
            other => other,
        };
        sessions.map_err(unavailable)
    }
}

fn unavailable(e: ProviderError) -> AuthError {
    tracing::error!("identity provider call failed: {}", e);
    AuthError::ProviderUnavailable(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{member_token, ProviderCall, ScriptedProvider};

    async fn authority(provider: &Arc<ScriptedProvider>) -> SessionAuthority {
        SessionAuthority::connect(provider.clone()).await.unwrap()
    }

    #[test]
    fn test_decode_claims_ignores_signature() {
        let token = member_token("sub-1", "ana");
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.sub, "sub-1");
        assert_eq!(claims.preferred_username.as_deref(), Some("ana"));
    }

    #[test]
    fn test_decode_claims_malformed() {
        assert!(matches!(decode_claims("not-a-jwt"), Err(AuthError::TokenMalformed(_))));
        assert!(matches!(decode_claims(""), Err(AuthError::TokenMalformed(_))));
    }

    #[tokio::test]
    async fn test_initialize_failure_leaves_authority_unusable() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_exchange(Err(ProviderError::GrantRejected("bad secret".into())));

        let authority = SessionAuthority::new(provider.clone());
        assert!(matches!(authority.initialize().await, Err(AuthError::AuthorityUnavailable)));

        let result = authority.verify(&member_token("sub-1", "ana")).await;
        assert!(matches!(result, Err(AuthError::AuthorityUnavailable)));
        assert_eq!(provider.session_checks(), 0);
    }

    #[tokio::test]
    async fn test_active_and_inactive_sessions() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;

        provider.push_sessions(Ok(1));
        assert!(authority.verify(&member_token("sub-1", "ana")).await.unwrap().active);

        provider.push_sessions(Ok(0));
        assert!(!authority.verify(&member_token("sub-1", "ana")).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_malformed_token_never_reaches_provider() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;

        let result = authority.verify("garbage").await;
        assert!(matches!(result, Err(AuthError::TokenMalformed(_))));
        assert_eq!(provider.session_checks(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_check_refreshes_once_and_retries() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        provider.push_sessions(Err(ProviderError::Unauthorized));
        provider.push_sessions(Ok(1));

        let check = authority.verify(&member_token("sub-1", "ana")).await.unwrap();
        assert!(check.active);
        assert_eq!(provider.session_checks(), 2);
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.logins(), 0);

        // the retry used the refreshed token
        let calls = provider.calls();
        assert!(matches!(
            &calls[2],
            ProviderCall::Sessions { access_token, .. } if access_token == "svc-2"
        ));
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_provider_unavailable() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        provider.push_sessions(Err(ProviderError::Unauthorized));
        provider.push_sessions(Err(ProviderError::Unauthorized));

        let result = authority.verify(&member_token("sub-1", "ana")).await;
        assert!(matches!(
            result,
            Err(AuthError::ProviderUnavailable(ProviderError::Unauthorized))
        ));
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.session_checks(), 2);
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_login() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        provider.push_sessions(Err(ProviderError::Unauthorized));
        provider.push_exchange(Err(ProviderError::GrantRejected("Token is not active".into())));

        let check = authority.verify(&member_token("sub-1", "ana")).await.unwrap();
        assert!(check.active);
        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.logins(), 1);

        // healthy provider afterwards: no further refresh needed
        provider.clear_calls();
        assert!(authority.verify(&member_token("sub-1", "ana")).await.unwrap().active);
        assert_eq!(provider.refreshes(), 0);
        assert_eq!(provider.logins(), 0);
    }

    #[tokio::test]
    async fn test_failed_relogin_disables_authority() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;

        provider.push_sessions(Err(ProviderError::Unauthorized));
        provider.push_exchange(Err(ProviderError::GrantRejected("expired".into())));
        provider.push_exchange(Err(ProviderError::ServerError {
            status: 502,
            context: "login".into(),
        }));

        let result = authority.verify(&member_token("sub-1", "ana")).await;
        assert!(matches!(result, Err(AuthError::AuthorityUnavailable)));
        assert!(authority.credential().await.is_none());

        let result = authority.verify(&member_token("sub-1", "ana")).await;
        assert!(matches!(result, Err(AuthError::AuthorityUnavailable)));
    }

    #[tokio::test]
    async fn test_provider_outage_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        provider.push_sessions(Err(ProviderError::ServerError {
            status: 503,
            context: "sessions".into(),
        }));

        let result = authority.verify(&member_token("sub-1", "ana")).await;
        assert!(matches!(result, Err(AuthError::ProviderUnavailable(_))));
        assert_eq!(provider.session_checks(), 1);
        assert_eq!(provider.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_checks_refresh_once() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        provider.push_sessions(Err(ProviderError::Unauthorized));
        provider.push_sessions(Err(ProviderError::Unauthorized));

        let token_a = member_token("sub-1", "ana");
        let token_b = member_token("sub-2", "bob");
        let (a, b) = tokio::join!(authority.verify(&token_a), authority.verify(&token_b),);
        assert!(a.unwrap().active);
        assert!(b.unwrap().active);

        assert_eq!(provider.refreshes(), 1);
        assert_eq!(provider.logins(), 0);
        assert_eq!(provider.session_checks(), 4);
    }

    #[tokio::test]
    async fn test_stale_refresh_is_skipped() {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = authority(&provider).await;
        provider.clear_calls();

        authority.refresh("some-older-token").await.unwrap();
        assert_eq!(provider.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_resolve_subject() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_user("sub-9", "ana");
        let authority = authority(&provider).await;

        assert_eq!(authority.resolve_subject("ana").await.unwrap(), "sub-9");
        assert!(matches!(
            authority.resolve_subject("bob").await,
            Err(AuthError::SubjectNotFound(_))
        ));
    }
}
