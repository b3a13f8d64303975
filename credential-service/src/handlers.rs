use axum::{
    extract::State,
    http::{header::SET_COOKIE, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::SecondsFormat;
use common_auth::{AuthContext, AuthError, AuthResult, TokenClaims, TokenClass};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::gateway::CurrentSession;
use crate::sessions::{new_session_id, Session, SessionData};
use crate::tokens::{IssuedTokens, TokenSubject};
use crate::AppState;

const SESSION_EMAIL: &str = "email";
const SESSION_ROLE: &str = "role";
const SESSION_REFRESH_TOKEN: &str = "refresh_token";

#[derive(Debug, Serialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
    pub access_token_expires_at: String,
    pub refresh_token_expires_at: String,
}

impl From<IssuedTokens> for SessionTokens {
    fn from(issued: IssuedTokens) -> Self {
        let IssuedTokens {
            access,
            refresh,
            token_type,
        } = issued;
        Self {
            access_token_expires_at: access.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            refresh_token_expires_at: refresh
                .expires_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: access.expires_in,
            refresh_expires_in: refresh.expires_in,
            token_type,
        }
    }
}

/// A freshly created session: the tokens handed to the client plus the
/// cookie that binds the browser to the server-side record.
#[derive(Debug)]
pub struct EstablishedSession {
    pub session: Session,
    pub tokens: SessionTokens,
    pub set_cookie: String,
}

impl IntoResponse for EstablishedSession {
    fn into_response(self) -> Response {
        ([(SET_COOKIE, self.set_cookie)], Json(self.tokens)).into_response()
    }
}

/// Entry point for the login flow once the user's credentials have been
/// checked elsewhere.
pub async fn establish_session(
    state: &AppState,
    subject: TokenSubject,
) -> AuthResult<EstablishedSession> {
    let issued = state.token_issuer.issue_pair(&subject)?;
    start_session(state, &subject, issued).await
}

async fn start_session(
    state: &AppState,
    subject: &TokenSubject,
    issued: IssuedTokens,
) -> AuthResult<EstablishedSession> {
    state.metrics.token_issued(TokenClass::Access);
    state.metrics.token_issued(TokenClass::Refresh);

    let mut data = SessionData::new();
    data.insert(SESSION_EMAIL.into(), Value::from(subject.email.as_str()));
    data.insert(SESSION_ROLE.into(), Value::from(subject.role.as_str()));
    data.insert(
        SESSION_REFRESH_TOKEN.into(),
        Value::from(issued.refresh.token.as_str()),
    );

    let ttl = state.config.jwt.refresh_ttl;
    let id = new_session_id();
    let session = state
        .sessions
        .create(&id, data, ttl)
        .await
        .inspect_err(|err| state.record_store_failure("create", err))?;

    info!(
        session = short_id(&session.id),
        expires_at = %session.expires_at,
        "Session established"
    );

    Ok(EstablishedSession {
        set_cookie: state.session_cookie.set_cookie(&session.id, ttl),
        session,
        tokens: issued.into(),
    })
}

pub async fn refresh_session(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Result<EstablishedSession, AuthError> {
    let loaded = session.ok_or(AuthError::MissingAuthorization)?;

    // Claim the session before anything else; a concurrent refresh with the
    // same cookie finds it gone.
    let session = state
        .sessions
        .take(&loaded.id)
        .await
        .inspect_err(|err| state.record_store_failure("take", err))?
        .ok_or(AuthError::MissingAuthorization)?;

    let refresh_token = session
        .get_str(SESSION_REFRESH_TOKEN)
        .ok_or_else(|| AuthError::MalformedToken("session holds no refresh token".into()))?;
    let claims = state
        .token_verifier
        .verify(refresh_token, TokenClass::Refresh)?;

    if session.get_str(SESSION_EMAIL) != Some(claims.subject.as_str()) {
        return Err(state.record_rejection(
            TokenClass::Refresh,
            AuthError::InvalidClaim("sub", "does not match the session".into()),
        ));
    }

    let subject = TokenSubject {
        email: claims.subject,
        role: claims.role,
    };
    let issued = state.token_issuer.issue_pair(&subject)?;
    start_session(&state, &subject, issued).await
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Response {
    if let Some(session) = session {
        match state.sessions.delete(&session.id).await {
            Ok(()) => info!(session = short_id(&session.id), "Session ended"),
            Err(err) => state.record_store_failure("delete", &err),
        }
    }

    (
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, state.session_cookie.clear_cookie())],
    )
        .into_response()
}

pub async fn current_session(auth: AuthContext) -> Json<TokenClaims> {
    Json(auth.into_claims())
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            error!(error = ?err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Enough of a session id to correlate log lines without leaking it.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
