use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::User;
use crate::roles::{Actor, Role};

use super::AppState;
use super::error::ApiError;

/// A signed-in user as the session provider knows them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub user_id: Ulid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn actor(&self) -> Actor {
        Actor::user(self.user_id, self.username.clone(), self.email.clone(), self.role)
    }

    pub fn user(&self) -> User {
        User {
            id: self.user_id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            created_at: Utc::now(),
        }
    }
}

/// Resolves bearer tokens. Login and session issuance live elsewhere.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Identity>;
}

#[derive(Debug)]
pub struct SessionsError(pub String);

impl std::fmt::Display for SessionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sessions file: {}", self.0)
    }
}

impl std::error::Error for SessionsError {}

/// Fixed token table, loaded from a JSON object of `token -> identity`.
#[derive(Debug, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, Identity>,
}

impl StaticSessions {
    pub fn new(sessions: HashMap<String, Identity>) -> Self {
        Self { sessions }
    }

    pub fn from_file(path: &Path) -> Result<Self, SessionsError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionsError(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SessionsError> {
        let sessions: HashMap<String, Identity> =
            serde_json::from_str(text).map_err(|e| SessionsError(e.to_string()))?;
        Ok(Self::new(sessions))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionProvider for StaticSessions {
    async fn resolve(&self, token: &str) -> Option<Identity> {
        self.sessions.get(token).cloned()
    }
}

/// Resolve a token and make sure the identity exists as a user row.
pub(crate) async fn authenticate(state: &AppState, token: &str) -> Result<Actor, ApiError> {
    let identity = state
        .sessions
        .resolve(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("invalid or expired session".into()))?;
    if let Err(e) = state.engine.register_user(identity.user()).await {
        tracing::warn!(user_id = %identity.user_id, error = %e, "failed to upsert session user");
    }
    Ok(identity.actor())
}

/// The caller of a request. No `Authorization` header means an anonymous visitor.
#[derive(Debug, Clone)]
pub struct Caller(pub Actor);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Ok(Caller(Actor::anonymous()));
        };
        let token = header
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiError::Unauthorized("expected `Authorization: Bearer <token>`".into())
            })?;
        authenticate(state, token.trim()).await.map(Caller)
    }
}
