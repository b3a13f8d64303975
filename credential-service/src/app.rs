use std::sync::Arc;

use axum::extract::FromRef;
use common_auth::{AuthError, KeyStore, TokenClass, TokenVerifier};
use tracing::warn;

use crate::config::ServiceConfig;
use crate::cookies::SessionCookie;
use crate::metrics::AuthMetrics;
use crate::sessions::SessionStore;
use crate::tokens::TokenIssuer;

#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<KeyStore>,
    pub token_issuer: Arc<TokenIssuer>,
    pub token_verifier: Arc<TokenVerifier>,
    pub sessions: Arc<dyn SessionStore>,
    pub session_cookie: Arc<SessionCookie>,
    pub config: Arc<ServiceConfig>,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<TokenVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.token_verifier.clone()
    }
}

impl FromRef<AppState> for Arc<TokenIssuer> {
    fn from_ref(state: &AppState) -> Self {
        state.token_issuer.clone()
    }
}

impl FromRef<AppState> for Arc<ServiceConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl AppState {
    /// Wires the credential components from one configuration. The key store
    /// must already hold both key pairs.
    pub fn new(
        config: ServiceConfig,
        keys: Arc<KeyStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(AuthMetrics::new()?);
        let token_issuer = TokenIssuer::new(config.jwt.token_config()?, keys.clone());
        let token_verifier = TokenVerifier::new(config.jwt.jwt_config(), keys.clone())
            .with_observer(metrics.clone());
        let session_cookie = SessionCookie::new(&config.cookie)?;

        Ok(Self {
            keys,
            token_issuer: Arc::new(token_issuer),
            token_verifier: Arc::new(token_verifier),
            sessions,
            session_cookie: Arc::new(session_cookie),
            config: Arc::new(config),
            metrics,
        })
    }

    /// Counts a credential failure found outside the verifier and hands the
    /// error back so it can be returned to the client.
    pub fn record_rejection(&self, class: TokenClass, err: AuthError) -> AuthError {
        self.metrics.token_rejected(class, &err);
        err
    }

    pub fn record_store_failure(&self, op: &'static str, err: &AuthError) {
        self.metrics.session_store_error(op);
        warn!(op, error_kind = err.kind(), error = %err, "Session store operation failed");
    }
}
