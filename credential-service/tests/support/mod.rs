#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::SET_COOKIE;
use axum::http::Response;
use axum::{Extension, Router};
use common_auth::KeyStore;
use credential_service::config::ServiceConfig;
use credential_service::gateway::{build_router, Transport};
use credential_service::sessions::{InMemorySessionStore, SessionStore};
use credential_service::tokens::TokenSubject;
use credential_service::AppState;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

pub const COOKIE_SECRET: &str = "integration-cookie-secret";

pub fn subject() -> TokenSubject {
    TokenSubject {
        email: "a@b.com".to_string(),
        role: "user".to_string(),
    }
}

pub fn test_config(key_dir: &Path, overrides: &[(&str, &str)]) -> Result<ServiceConfig> {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("COOKIE_SECRET".to_string(), COOKIE_SECRET.to_string()),
        ("JWT_KEY_DIR".to_string(), key_dir.display().to_string()),
        ("HTTPS_PORT".to_string(), "8443".to_string()),
        ("PORT".to_string(), "8080".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    ServiceConfig::from_lookup(|key| vars.get(key).cloned())
}

pub struct TestApp {
    // Keeps the key directory alive for the lifetime of the test.
    _keys_dir: TempDir,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        Self::with_store(Arc::new(InMemorySessionStore::new()), &[])
    }

    pub fn with_store(sessions: Arc<dyn SessionStore>, overrides: &[(&str, &str)]) -> Result<Self> {
        let dir = tempdir()?;
        let config = test_config(dir.path(), overrides)?;
        let keys = Arc::new(KeyStore::new(
            config.jwt.key_dir.clone(),
            config.jwt.identifiers.clone(),
        ));
        keys.ensure_all().context("generate test keys")?;
        let state = AppState::new(config, keys, sessions)?;
        Ok(Self {
            _keys_dir: dir,
            state,
        })
    }

    /// Router as served by the TLS listener.
    pub fn secure_router(&self) -> Router {
        build_router(self.state.clone()).layer(Extension(Transport::Encrypted))
    }

    /// Router as served by the plaintext listener.
    pub fn plain_router(&self) -> Router {
        build_router(self.state.clone()).layer(Extension(Transport::Plaintext))
    }
}

/// The `name=value` pair from a `Set-Cookie` header, ready to send back.
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

pub fn response_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub async fn json_body(response: Response<Body>) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn text_body(response: Response<Body>) -> Result<String> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}
