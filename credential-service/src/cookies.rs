use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::{CookieConfig, CookieSameSite};

type HmacSha256 = Hmac<Sha256>;

/// Cookies sent with the current request, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RequestCookies(HashMap<String, String>);

impl RequestCookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cookies = HashMap::new();
        for value in headers.get_all(COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    let name = name.trim();
                    if !name.is_empty() {
                        // First occurrence wins, as browsers send the most specific path first.
                        cookies
                            .entry(name.to_string())
                            .or_insert_with(|| value.trim().to_string());
                    }
                }
            }
        }
        Self(cookies)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Encodes the session id into a signed cookie value and builds the
/// `Set-Cookie` headers. The secret signs the cookie only, never tokens.
#[derive(Clone)]
pub struct SessionCookie {
    name: String,
    mac: HmacSha256,
    same_site: CookieSameSite,
    http_only: bool,
    secure: bool,
}

impl SessionCookie {
    pub fn new(config: &CookieConfig) -> Result<Self> {
        let mac = <HmacSha256 as Mac>::new_from_slice(config.secret.as_bytes())
            .map_err(|_| anyhow!("Invalid cookie secret"))?;
        Ok(Self {
            name: config.name.clone(),
            mac,
            same_site: config.same_site,
            http_only: config.http_only,
            secure: config.secure,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sign(&self, session_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(session_id.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{session_id}.{signature}")
    }

    /// Returns the session id if the cookie value carries a valid signature.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (session_id, signature) = value.rsplit_once('.')?;
        if session_id.is_empty() {
            return None;
        }
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(session_id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(session_id.to_string())
    }

    pub fn session_id(&self, cookies: &RequestCookies) -> Option<String> {
        cookies.get(&self.name).and_then(|value| self.verify(value))
    }

    pub fn set_cookie(&self, session_id: &str, max_age: Duration) -> String {
        self.render(&self.sign(session_id), max_age.as_secs())
    }

    pub fn clear_cookie(&self) -> String {
        self.render("", 0)
    }

    fn render(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; SameSite={}",
            self.name,
            value,
            max_age,
            self.same_site.as_str()
        );
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}
