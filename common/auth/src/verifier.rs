use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::class::TokenClass;
use crate::claims::TokenClaims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::keys::KeyStore;

/// Notified of every token the verifier (or the bearer extractor) turns away.
pub trait RejectionObserver: Send + Sync {
    fn token_rejected(&self, class: TokenClass, err: &AuthError);
}

/// Checks bearer tokens against the public key of a token class.
#[derive(Clone)]
pub struct TokenVerifier {
    config: JwtConfig,
    keys: Arc<KeyStore>,
    observer: Option<Arc<dyn RejectionObserver>>,
}

impl TokenVerifier {
    pub fn new(config: JwtConfig, keys: Arc<KeyStore>) -> Self {
        Self {
            config,
            keys,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RejectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn verify(&self, token: &str, class: TokenClass) -> AuthResult<TokenClaims> {
        self.verify_at(token, class, Utc::now())
    }

    /// Same as [`TokenVerifier::verify`] with an explicit notion of "now".
    /// A token stays valid up to and including `exp + leeway`.
    pub fn verify_at(
        &self,
        token: &str,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> AuthResult<TokenClaims> {
        match self.check(token, class, now) {
            Ok(claims) => {
                debug!(token_class = %class, "verified JWT successfully");
                Ok(claims)
            }
            Err(err) => Err(self.reject(class, err)),
        }
    }

    /// Logs and reports a rejected credential, handing the error back.
    pub fn reject(&self, class: TokenClass, err: AuthError) -> AuthError {
        warn!(
            token_class = %class,
            error_kind = err.kind(),
            error = %err,
            "Rejected bearer token"
        );
        if let Some(observer) = &self.observer {
            observer.token_rejected(class, &err);
        }
        err
    }

    fn check(
        &self,
        token: &str,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> AuthResult<TokenClaims> {
        let header = decode_header(token)
            .map_err(|err| AuthError::MalformedToken(err.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidSignature);
        }

        let key = self.keys.public_key(class)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        // Expiry is checked below against the caller's clock.
        validation.validate_exp = false;

        let token_data = decode::<Value>(token, &key, &validation).map_err(map_decode_error)?;
        let claims = TokenClaims::try_from(token_data.claims)?;

        let deadline = claims.expires_at.timestamp() + i64::from(self.config.leeway_seconds);
        if now.timestamp() > deadline {
            return Err(AuthError::ExpiredToken);
        }

        Ok(claims)
    }
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::InvalidRsaKey(_) => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        ErrorKind::InvalidIssuer => AuthError::InvalidClaim("iss", err.to_string()),
        ErrorKind::InvalidAudience => AuthError::InvalidClaim("aud", err.to_string()),
        _ => AuthError::MalformedToken(err.to_string()),
    }
}
