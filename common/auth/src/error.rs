use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::class::TokenClass;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to generate {class} key pair: {reason}")]
    KeyGeneration { class: TokenClass, reason: String },
    #[error("failed to load {class} key material: {reason}")]
    KeyLoad { class: TokenClass, reason: String },
    #[error("failed to sign {class} token: {reason}")]
    Signing { class: TokenClass, reason: String },
    #[error("invalid claims: {0}")]
    Claims(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    ExpiredToken,
    #[error("invalid claim '{0}': {1}")]
    InvalidClaim(&'static str, String),
    #[error("session store error: {0}")]
    SessionStore(String),
    #[error("failed to load TLS material: {0}")]
    TlsLoad(String),
    #[error("authorization header missing")]
    MissingAuthorization,
    #[error("authorization header malformed")]
    InvalidAuthorization,
}

impl AuthError {
    /// Stable label used in audit logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::KeyGeneration { .. } => "key_generation",
            AuthError::KeyLoad { .. } => "key_load",
            AuthError::Signing { .. } => "signing",
            AuthError::Claims(_) => "claims",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::ExpiredToken => "expired_token",
            AuthError::InvalidClaim(_, _) => "invalid_claim",
            AuthError::SessionStore(_) => "session_store",
            AuthError::TlsLoad(_) => "tls_load",
            AuthError::MissingAuthorization => "missing_authorization",
            AuthError::InvalidAuthorization => "invalid_authorization",
        }
    }

    /// Errors that leave the process without usable credentials or transport.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::KeyGeneration { .. } | AuthError::KeyLoad { .. } | AuthError::TlsLoad(_)
        )
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Clients only ever learn "not authenticated"; the kind stays in the logs.
        let (status, body) = if self.is_fatal() {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "SERVER_ERROR",
                    message: "Authentication is temporarily unavailable.",
                },
            )
        } else {
            (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "UNAUTHENTICATED",
                    message: "Authentication required.",
                },
            )
        };
        (status, Json(body)).into_response()
    }
}
