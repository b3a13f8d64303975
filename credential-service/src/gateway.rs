//! Request pipeline shared by both listeners.
//!
//! Every request passes, in this order: transport enforcement, cookie
//! parsing, session loading, then the route handler. Handlers that read
//! [`CurrentSession`] rely on the two middlewares before them.

use axum::extract::{Request, State};
use axum::http::header::{HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tracing::{debug, error};

use crate::app::AppState;
use crate::cookies::RequestCookies;
use crate::handlers::{current_session, health, logout, metrics_endpoint, refresh_session};
use crate::sessions::Session;

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const DEFAULT_HTTPS_PORT: u16 = 443;

/// How the connection carrying a request reached us. Each listener stamps
/// its own value onto every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Encrypted,
    Plaintext,
}

/// The session referenced by the request's cookie, if it exists and is live.
#[derive(Debug, Clone, Default)]
pub struct CurrentSession(pub Option<Session>);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/session", get(current_session))
        .route("/api/session/refresh", post(refresh_session))
        .route("/api/session/logout", post(logout))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    enforce_secure_transport,
                ))
                .layer(middleware::from_fn(parse_cookies))
                .layer(middleware::from_fn_with_state(state.clone(), load_session)),
        )
        .with_state(state)
}

pub async fn enforce_secure_transport(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_secure(&request, state.config.trust_proxy) {
        return next.run(request).await;
    }

    match secure_location(request.headers(), request.uri(), state.config.https_port) {
        Some(location) => {
            debug!(%location, "Redirecting plaintext request");
            (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response()
        }
        None => (StatusCode::BAD_REQUEST, "Missing or invalid Host header").into_response(),
    }
}

pub async fn parse_cookies(mut request: Request, next: Next) -> Response {
    let cookies = RequestCookies::from_headers(request.headers());
    request.extensions_mut().insert(cookies);
    next.run(request).await
}

pub async fn load_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(cookies) = request.extensions().get::<RequestCookies>() else {
        error!("Session middleware ran before cookie parsing; check layer order");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let session = match state.session_cookie.session_id(cookies) {
        Some(id) => match state.sessions.get(&id).await {
            Ok(session) => session,
            Err(err) => {
                // Store outages degrade to "not authenticated".
                state.record_store_failure("get", &err);
                None
            }
        },
        None => None,
    };

    request.extensions_mut().insert(CurrentSession(session));
    next.run(request).await
}

fn is_secure(request: &Request, trust_proxy: bool) -> bool {
    if request.extensions().get::<Transport>() == Some(&Transport::Encrypted) {
        return true;
    }
    trust_proxy
        && request
            .headers()
            .get(FORWARDED_PROTO)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

/// Builds the `https://` equivalent of the request URL, or `None` when the
/// request carries no usable `Host` header.
pub fn secure_location(headers: &HeaderMap, uri: &Uri, https_port: u16) -> Option<String> {
    let raw_host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))?;
    let hostname = strip_port(raw_host.trim());
    if hostname.is_empty() || hostname.contains(['/', '@', ' ']) {
        return None;
    }

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if https_port == DEFAULT_HTTPS_PORT {
        Some(format!("https://{hostname}{path}"))
    } else {
        Some(format!("https://{hostname}:{https_port}{path}"))
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal: keep the brackets, drop anything after them.
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => "",
        };
    }
    host.split(':').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_host(host: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static(host));
        headers
    }

    #[test]
    fn location_drops_plaintext_port_and_keeps_query() {
        let uri: Uri = "/api/user?page=2".parse().unwrap();
        let location = secure_location(&headers_with_host("example.com:8080"), &uri, 443);
        assert_eq!(location.as_deref(), Some("https://example.com/api/user?page=2"));
    }

    #[test]
    fn location_uses_non_default_https_port() {
        let uri: Uri = "/".parse().unwrap();
        let location = secure_location(&headers_with_host("localhost:8080"), &uri, 8443);
        assert_eq!(location.as_deref(), Some("https://localhost:8443/"));
    }

    #[test]
    fn location_handles_ipv6_hosts() {
        let uri: Uri = "/x".parse().unwrap();
        let location = secure_location(&headers_with_host("[::1]:80"), &uri, 443);
        assert_eq!(location.as_deref(), Some("https://[::1]/x"));
    }

    #[test]
    fn location_requires_a_host() {
        let uri: Uri = "/x".parse().unwrap();
        assert!(secure_location(&HeaderMap::new(), &uri, 443).is_none());
        assert!(secure_location(&headers_with_host("evil.com/@x"), &uri, 443).is_none());
    }

    #[test]
    fn forwarded_proto_only_counts_behind_trusted_proxy() {
        let request = axum::http::Request::builder()
            .uri("/")
            .header(FORWARDED_PROTO, "https")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(is_secure(&request, true));
        assert!(!is_secure(&request, false));
    }

    #[test]
    fn encrypted_transport_is_secure() {
        let mut request = axum::http::Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(!is_secure(&request, false));
        request.extensions_mut().insert(Transport::Encrypted);
        assert!(is_secure(&request, false));
    }
}
