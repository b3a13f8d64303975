use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header::AUTHORIZATION, request::Parts};

use crate::class::TokenClass;
use crate::claims::TokenClaims;
use crate::error::{AuthError, AuthResult};
use crate::verifier::TokenVerifier;

/// Extracts verified access-token claims from the `Authorization` header.
///
/// Every failure, including a missing or non-bearer header, is reported
/// through [`TokenVerifier::reject`] so it is logged and counted once.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: TokenClaims,
    pub token: String,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.claims.has_role(role)
    }

    pub fn into_claims(self) -> TokenClaims {
        self.claims
    }

    fn from_parts(parts: &Parts, verifier: &TokenVerifier) -> AuthResult<Self> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingAuthorization)
            .and_then(parse_bearer)
            .map_err(|err| verifier.reject(TokenClass::Access, err))?;
        let claims = verifier.verify(&token, TokenClass::Access)?;
        Ok(Self { claims, token })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<TokenVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<TokenVerifier>::from_ref(state);
        Self::from_parts(parts, &verifier)
    }
}

fn parse_bearer(value: &axum::http::HeaderValue) -> AuthResult<String> {
    let raw = value
        .to_str()
        .map_err(|_| AuthError::InvalidAuthorization)?
        .trim();

    let token = raw
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthorization)?
        .trim();

    if token.is_empty() {
        return Err(AuthError::InvalidAuthorization);
    }

    Ok(token.to_owned())
}
