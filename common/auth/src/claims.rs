use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Application-focused representation of verified JWT claims.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenClaims {
    /// The user's email address (`sub`).
    pub subject: String,
    pub role: String,
    pub issuer: String,
    pub audience: String,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl TokenClaims {
    /// Convenience helper for role checks.
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    role: String,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    iss: String,
    aud: AudienceRepr,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Many(Vec<String>),
}

impl TryFrom<ClaimsRepr> for TokenClaims {
    type Error = AuthError;

    fn try_from(value: ClaimsRepr) -> AuthResult<Self> {
        let expires_at = Utc
            .timestamp_opt(value.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidClaim("exp", value.exp.to_string()))?;

        let issued_at = match value.iat {
            Some(iat) => Some(
                Utc.timestamp_opt(iat, 0)
                    .single()
                    .ok_or_else(|| AuthError::InvalidClaim("iat", iat.to_string()))?,
            ),
            None => None,
        };

        let audience = match value.aud {
            AudienceRepr::Single(item) => item,
            AudienceRepr::Many(items) => items
                .into_iter()
                .next()
                .ok_or_else(|| AuthError::InvalidClaim("aud", "empty audience list".into()))?,
        };

        Ok(Self {
            subject: value.sub,
            role: value.role,
            issuer: value.iss,
            audience,
            expires_at,
            issued_at,
        })
    }
}

impl TryFrom<serde_json::Value> for TokenClaims {
    type Error = AuthError;

    fn try_from(value: serde_json::Value) -> AuthResult<Self> {
        let repr: ClaimsRepr = serde_json::from_value(value)
            .map_err(|err| AuthError::MalformedToken(err.to_string()))?;
        TokenClaims::try_from(repr)
    }
}
