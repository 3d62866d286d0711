//! Test doubles shared with downstream crates (`test-support` feature)

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};

use crate::auth::Claims;
use crate::keycloak::{
    Grant, IdentityProvider, ProviderError, TokenResponse, UserRecord, UserSession,
};

/// Sign a member access token with a throwaway key. The authority never
/// checks the signature, only the claims.
pub fn member_token(subject: &str, username: &str) -> String {
    let claims = Claims {
        sub: subject.to_string(),
        preferred_username: Some(username.to_string()),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-only"))
        .unwrap_or_default()
}

/// A provider call as seen by `ScriptedProvider`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Exchange(Grant),
    Sessions { access_token: String, subject: String },
    Users { access_token: String, username: String },
}

#[derive(Default)]
struct Script {
    exchanges: VecDeque<Result<TokenResponse, ProviderError>>,
    sessions: VecDeque<Result<usize, ProviderError>>,
    users: Vec<UserRecord>,
    calls: Vec<ProviderCall>,
    issued: u32,
}

/// In-process identity provider answering from queued responses.
///
/// With nothing queued, exchanges succeed with `svc-1`, `svc-2`, ... access
/// tokens and session checks report one active session.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_exchange(&self, response: Result<TokenResponse, ProviderError>) {
        self.script().exchanges.push_back(response);
    }

    /// Queue a session check answer: the number of active sessions, or an error
    pub fn push_sessions(&self, response: Result<usize, ProviderError>) {
        self.script().sessions.push_back(response);
    }

    pub fn add_user(&self, id: &str, username: &str) {
        self.script().users.push(UserRecord {
            id: id.to_string(),
            username: username.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.script().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }

    pub fn session_checks(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Sessions { .. }))
    }

    pub fn refreshes(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Exchange(Grant::RefreshToken(_))))
    }

    pub fn logins(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Exchange(Grant::ClientCredentials)))
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.script().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn exchange(&self, grant: &Grant) -> Result<TokenResponse, ProviderError> {
        let mut script = self.script();
        script.calls.push(ProviderCall::Exchange(grant.clone()));

        if let Some(response) = script.exchanges.pop_front() {
            return response;
        }
        script.issued += 1;
        Ok(TokenResponse {
            access_token: format!("svc-{}", script.issued),
            refresh_token: Some(format!("svc-refresh-{}", script.issued)),
            expires_in: Some(60),
        })
    }

    async fn user_sessions(
        &self,
        access_token: &str,
        subject: &str,
    ) -> Result<Vec<UserSession>, ProviderError> {
        let response = {
            let mut script = self.script();
            script.calls.push(ProviderCall::Sessions {
                access_token: access_token.to_string(),
                subject: subject.to_string(),
            });
            script.sessions.pop_front().unwrap_or(Ok(1))
        };
        // suspend so joined callers interleave between request and answer
        tokio::task::yield_now().await;

        let count = response?;
        Ok((0..count)
            .map(|i| UserSession {
                id: format!("{subject}-session-{i}"),
                username: None,
                last_access: None,
            })
            .collect())
    }

    async fn find_users(
        &self,
        access_token: &str,
        username: &str,
    ) -> Result<Vec<UserRecord>, ProviderError> {
        let mut script = self.script();
        script.calls.push(ProviderCall::Users {
            access_token: access_token.to_string(),
            username: username.to_string(),
        });

        Ok(script
            .users
            .iter()
            .filter(|u| u.username == username)
            .cloned()
            .collect())
    }
}
