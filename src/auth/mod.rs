//! Identity verification for the upgrade endpoint and the REST surface.

pub mod jwt;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::db::models::UserId;
use crate::state::AppState;

pub use jwt::JwtVerifier;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    Missing,

    #[error("credential expired")]
    Expired,

    #[error("credential invalid: {0}")]
    Invalid(String),
}

/// Turns a bearer credential into the user id it was issued for.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Authenticated caller, extracted from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        state.verifier.verify(token).map(AuthUser).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer credential");
            StatusCode::UNAUTHORIZED
        })
    }
}
