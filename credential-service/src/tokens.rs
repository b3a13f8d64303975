use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common_auth::{AuthError, AuthResult, KeyStore, TokenClass};
use jsonwebtoken::{encode, Algorithm, Header};
use serde::Serialize;
use tracing::{debug, warn};

pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

impl TokenConfig {
    pub fn ttl_seconds(&self, class: TokenClass) -> i64 {
        match class {
            TokenClass::Access => self.access_ttl_seconds,
            TokenClass::Refresh => self.refresh_ttl_seconds,
        }
    }
}

/// The authenticated user fields that end up in a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub class: TokenClass,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
    pub token_type: &'static str,
}

/// Signs claims with the private key of a token class. Key material is
/// fetched from the [`KeyStore`] per call and dropped afterwards.
pub struct TokenIssuer {
    config: TokenConfig,
    keys: Arc<KeyStore>,
}

impl TokenIssuer {
    pub fn new(config: TokenConfig, keys: Arc<KeyStore>) -> Self {
        Self { config, keys }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn issue(&self, subject: &TokenSubject, class: TokenClass) -> AuthResult<IssuedToken> {
        self.issue_at(subject, class, Utc::now())
    }

    pub fn issue_at(
        &self,
        subject: &TokenSubject,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedToken> {
        match self.sign(subject, class, now) {
            Ok(issued) => {
                debug!(token_class = %class, expires_at = %issued.expires_at, "Issued token");
                Ok(issued)
            }
            Err(err) => {
                warn!(
                    token_class = %class,
                    error_kind = err.kind(),
                    error = %err,
                    "Failed to issue token"
                );
                Err(err)
            }
        }
    }

    /// Issues an access and a refresh token sharing the same issue time.
    pub fn issue_pair(&self, subject: &TokenSubject) -> AuthResult<IssuedTokens> {
        let now = Utc::now();
        let access = self.issue_at(subject, TokenClass::Access, now)?;
        let refresh = self.issue_at(subject, TokenClass::Refresh, now)?;
        Ok(IssuedTokens {
            access,
            refresh,
            token_type: "Bearer",
        })
    }

    fn sign(
        &self,
        subject: &TokenSubject,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedToken> {
        if subject.email.trim().is_empty() {
            return Err(AuthError::Claims("subject must not be empty".into()));
        }
        if subject.role.trim().is_empty() {
            return Err(AuthError::Claims("role must not be empty".into()));
        }

        let signing_err = |reason: String| AuthError::Signing { class, reason };

        let expires_in = self.config.ttl_seconds(class);
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| signing_err(format!("TTL of {expires_in}s is out of range")))?;

        let claims = SignedClaims {
            sub: &subject.email,
            role: &subject.role,
            iss: &self.config.issuer,
            aud: &self.config.audience,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let key = self
            .keys
            .private_key(class)
            .map_err(|err| signing_err(err.to_string()))?;

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.identifier(class).to_string());

        let token = encode(&header, &claims, &key).map_err(|err| signing_err(err.to_string()))?;

        Ok(IssuedToken {
            token,
            class,
            expires_at,
            expires_in,
        })
    }
}

#[derive(Serialize)]
struct SignedClaims<'a> {
    sub: &'a str,
    role: &'a str,
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}
