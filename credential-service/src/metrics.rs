use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use common_auth::{AuthError, RejectionObserver, TokenClass};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    tokens_issued: IntCounterVec,
    token_rejections: IntCounterVec,
    session_store_errors: IntCounterVec,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tokens_issued = IntCounterVec::new(
            Opts::new("auth_tokens_issued_total", "Count of tokens issued by class"),
            &["class"],
        )?;
        registry.register(Box::new(tokens_issued.clone()))?;

        let token_rejections = IntCounterVec::new(
            Opts::new(
                "auth_token_rejections_total",
                "Count of rejected or unissuable tokens grouped by class and error kind",
            ),
            &["class", "kind"],
        )?;
        registry.register(Box::new(token_rejections.clone()))?;

        let session_store_errors = IntCounterVec::new(
            Opts::new(
                "auth_session_store_errors_total",
                "Count of failed session store operations",
            ),
            &["op"],
        )?;
        registry.register(Box::new(session_store_errors.clone()))?;

        Ok(Self {
            registry,
            tokens_issued,
            token_rejections,
            session_store_errors,
        })
    }

    pub fn token_issued(&self, class: TokenClass) {
        self.tokens_issued.with_label_values(&[class.as_str()]).inc();
    }

    pub fn token_rejected(&self, class: TokenClass, err: &AuthError) {
        self.token_rejections
            .with_label_values(&[class.as_str(), err.kind()])
            .inc();
    }

    pub fn session_store_error(&self, op: &str) {
        self.session_store_errors.with_label_values(&[op]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

impl RejectionObserver for AuthMetrics {
    fn token_rejected(&self, class: TokenClass, err: &AuthError) {
        AuthMetrics::token_rejected(self, class, err);
    }
}
