//! Bearer-token identity.
//!
//! User tokens are HS256 JWTs issued by the identity service with the claim
//! shape `{"user": {"id": "..."}, "exp": ..., "iat": ...}`. The same token
//! authenticates REST calls (`Authorization: Bearer`) and the realtime
//! handshake (header or `token` query parameter), and the actor id used for
//! every authorization decision is always taken from it.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use gigroom_shared::UserId;

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsUser {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user: ClaimsUser,
    /// Expiration (Unix seconds).
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum JwtError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token scheme (expected Bearer)")]
    InvalidScheme,

    #[error("Token expired")]
    ExpiredToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid token issuer")]
    InvalidIssuer,

    #[error("Token carries an invalid user id: {0}")]
    InvalidSubject(String),

    #[error("Token validation failed: {0}")]
    ValidationFailed(String),
}

impl From<JwtError> for ServerError {
    fn from(e: JwtError) -> Self {
        ServerError::Unauthorized(e.to_string())
    }
}

/// Token validation settings.
#[derive(Clone)]
pub struct JwtConfig {
    secret: Vec<u8>,
    issuer: Option<String>,
}

impl JwtConfig {
    pub fn new(secret: impl Into<Vec<u8>>, issuer: Option<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer,
        }
    }

    /// Validate a token and return the actor it identifies.
    pub fn validate_token(&self, token: &str) -> Result<UserId, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let claims = decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::ExpiredToken,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => JwtError::InvalidIssuer,
                _ => JwtError::ValidationFailed(e.to_string()),
            })
            .inspect_err(|e| warn!(error = %e, "token rejected"))?;

        let actor = UserId::parse(&claims.user.id)
            .map_err(|e| JwtError::InvalidSubject(e.to_string()))?;
        debug!(actor = %actor, "token validated");
        Ok(actor)
    }

    /// Sign a token for `user` valid for `ttl_secs` seconds.
    pub fn issue_token(&self, user: &UserId, ttl_secs: u64) -> Result<String, JwtError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            user: ClaimsUser {
                id: user.to_string(),
            },
            exp: now + ttl_secs,
            iat: Some(now),
            iss: self.issuer.clone(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| JwtError::ValidationFailed(e.to_string()))
    }
}

/// Extract the token from an `Authorization` header value.
pub fn extract_token_from_header(auth_header: &str) -> Result<&str, JwtError> {
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(JwtError::InvalidScheme)?
        .trim();
    if token.is_empty() {
        return Err(JwtError::MissingToken);
    }
    Ok(token)
}

/// Token from the `Authorization` header, if one was sent.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, JwtError> {
    match headers.get("authorization") {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| JwtError::InvalidScheme)?;
            extract_token_from_header(value).map(Some)
        }
    }
}

/// The authenticated user behind a REST request.
#[derive(Debug, Clone)]
pub struct Actor(pub UserId);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
    Arc<JwtConfig>: FromRef<S>,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jwt = Arc::<JwtConfig>::from_ref(state);
        let token = bearer_token(&parts.headers)?.ok_or(JwtError::MissingToken)?;
        Ok(Actor(jwt.validate_token(token)?))
    }
}
