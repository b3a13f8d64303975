mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{Request, StatusCode};
use credential_service::handlers::establish_session;
use credential_service::sessions::{InMemorySessionStore, SessionStore};
use support::{cookie_pair, json_body, response_cookie, subject, TestApp};
use tower::util::ServiceExt;

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn refresh_request(cookie: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri("/api/session/refresh")
        .header("host", "localhost")
        .header(COOKIE, cookie)
        .body(Body::empty())?)
}

#[tokio::test]
async fn establish_refresh_and_logout() -> Result<()> {
    let store = Arc::new(InMemorySessionStore::new());
    let app = TestApp::with_store(store.clone(), &[])?;

    let established = establish_session(&app.state, subject()).await?;
    assert_eq!(established.tokens.token_type, "Bearer");
    assert_eq!(established.tokens.expires_in, 900);
    assert_eq!(established.session.get_str("email"), Some("a@b.com"));
    assert_eq!(established.session.get_str("role"), Some("user"));
    assert_eq!(
        established.session.get_str("refresh_token"),
        Some(established.tokens.refresh_token.as_str())
    );
    assert!(established.set_cookie.contains("Max-Age=604800"));
    let first_cookie = cookie_pair(&established.set_cookie);
    let first_id = established.session.id.clone();

    // Whoami with the access token.
    let response = app
        .secure_router()
        .oneshot(
            Request::builder()
                .uri("/api/session")
                .header("host", "localhost")
                .header(
                    AUTHORIZATION,
                    format!("Bearer {}", established.tokens.access_token),
                )
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let claims = json_body(response).await?;
    assert_eq!(claims["subject"], "a@b.com");
    assert_eq!(claims["role"], "user");

    // Refresh rotates the session.
    let response = app
        .secure_router()
        .oneshot(refresh_request(&first_cookie)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response_cookie(&response).context("refresh sets a cookie")?;
    let second_cookie = cookie_pair(&set_cookie);
    assert_ne!(second_cookie, first_cookie);
    let body = json_body(response).await?;
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(body["refresh_token"].as_str().is_some());
    assert!(body["refresh_token_expires_at"].as_str().is_some());
    assert!(store.get(&first_id).await?.is_none());
    assert_eq!(store.len().await, 1);

    // The old cookie no longer resolves to a session.
    let response = app
        .secure_router()
        .oneshot(refresh_request(&first_cookie)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["code"], "UNAUTHENTICATED");

    // Logout clears the session and the cookie.
    let response = app
        .secure_router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/session/logout")
                .header("host", "localhost")
                .header(COOKIE, &second_cookie)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cleared = response_cookie(&response).context("logout clears the cookie")?;
    assert!(cleared.contains("Max-Age=0"));
    assert!(store.is_empty().await);

    let response = app
        .secure_router()
        .oneshot(refresh_request(&second_cookie)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refresh_session_lasts_seven_days() -> Result<()> {
    let store = Arc::new(InMemorySessionStore::new());
    let app = TestApp::with_store(store.clone(), &[])?;

    let established = establish_session(&app.state, subject()).await?;
    let cookie = cookie_pair(&established.set_cookie);

    tokio::time::advance(SEVEN_DAYS - Duration::from_secs(1)).await;
    assert!(store.get(&established.session.id).await?.is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.get(&established.session.id).await?.is_none());

    let response = app
        .secure_router()
        .oneshot(refresh_request(&cookie)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn forged_cookie_is_unauthenticated() -> Result<()> {
    let store = Arc::new(InMemorySessionStore::new());
    let app = TestApp::with_store(store.clone(), &[])?;

    let established = establish_session(&app.state, subject()).await?;
    let forged = format!("sid={}.AAAA", established.session.id);

    let response = app
        .secure_router()
        .oneshot(refresh_request(&forged)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // The session itself is untouched.
    assert!(store.get(&established.session.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn whoami_requires_an_access_token() -> Result<()> {
    let app = TestApp::new()?;
    let established = establish_session(&app.state, subject()).await?;

    let missing = app
        .secure_router()
        .oneshot(
            Request::builder()
                .uri("/api/session")
                .header("host", "localhost")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong_class = app
        .secure_router()
        .oneshot(
            Request::builder()
                .uri("/api/session")
                .header("host", "localhost")
                .header(
                    AUTHORIZATION,
                    format!("Bearer {}", established.tokens.refresh_token),
                )
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(wrong_class.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(wrong_class).await?;
    assert_eq!(body["code"], "UNAUTHENTICATED");
    Ok(())
}

#[tokio::test]
async fn concurrent_refreshes_with_one_cookie_yield_one_session() -> Result<()> {
    let store = Arc::new(InMemorySessionStore::new());
    let app = TestApp::with_store(store.clone(), &[])?;

    let established = establish_session(&app.state, subject()).await?;
    let cookie = cookie_pair(&established.set_cookie);

    let (first, second) = tokio::join!(
        app.secure_router().oneshot(refresh_request(&cookie)?),
        app.secure_router().oneshot(refresh_request(&cookie)?),
    );
    let mut statuses = [first?.status(), second?.status()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::UNAUTHORIZED]);
    assert_eq!(store.len().await, 1);
    assert!(store.get(&established.session.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn access_token_rejections_are_counted() -> Result<()> {
    let app = TestApp::new()?;
    let established = establish_session(&app.state, subject()).await?;

    for authorization in [
        Some(format!("Bearer {}", established.tokens.refresh_token)),
        None,
    ] {
        let mut request = Request::builder()
            .uri("/api/session")
            .header("host", "localhost");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = app
            .secure_router()
            .oneshot(request.body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app
        .secure_router()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .header("host", "localhost")
                .body(Body::empty())?,
        )
        .await?;
    let metrics = support::text_body(response).await?;
    assert!(
        metrics.contains(
            "auth_token_rejections_total{class=\"access\",kind=\"invalid_signature\"} 1"
        ),
        "{metrics}"
    );
    assert!(
        metrics.contains(
            "auth_token_rejections_total{class=\"access\",kind=\"missing_authorization\"} 1"
        ),
        "{metrics}"
    );
    Ok(())
}
