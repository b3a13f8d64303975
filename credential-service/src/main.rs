use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::Extension;
use common_auth::KeyStore;
use credential_service::config::load_service_config;
use credential_service::gateway::{build_router, Transport};
use credential_service::sessions::RedisSessionStore;
use credential_service::tls::TlsKeyProvider;
use credential_service::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = load_service_config()?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    // Both key pairs must exist before anything can sign or verify.
    let keys = Arc::new(KeyStore::new(
        config.jwt.key_dir.clone(),
        config.jwt.identifiers.clone(),
    ));
    let ensure = keys.clone();
    tokio::task::spawn_blocking(move || ensure.ensure_all())
        .await
        .context("Key generation task panicked")?
        .context("Failed to prepare JWT signing keys")?;
    info!(dir = %keys.dir().display(), "JWT signing keys ready");

    let certificate = TlsKeyProvider::new(&config.tls)
        .load()
        .context("Failed to load TLS certificate")?;
    let tls_config = certificate
        .rustls_config()
        .await
        .context("Failed to build TLS configuration")?;

    let sessions = RedisSessionStore::new(&config.session_store)
        .context("Failed to configure session store")?;

    let ip: IpAddr = config.host.parse().context("Failed to parse HOST")?;
    let https_addr = SocketAddr::from((ip, config.https_port));
    let http_addr = SocketAddr::from((ip, config.http_port));

    let state = AppState::new(config, keys, Arc::new(sessions))?;
    let router = build_router(state);
    let secure_app = router.clone().layer(Extension(Transport::Encrypted));
    let plain_app = router.layer(Extension(Transport::Plaintext));

    let https = async move {
        info!(%https_addr, "starting credential-service (TLS)");
        axum_server::bind_rustls(https_addr, tls_config)
            .serve(secure_app.into_make_service())
            .await
            .context("HTTPS listener failed")
    };

    let http = async move {
        info!(%http_addr, "starting credential-service redirect listener");
        let listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind {http_addr}"))?;
        axum::serve(listener, plain_app)
            .await
            .context("HTTP listener failed")
    };

    tokio::try_join!(https, http)?;
    Ok(())
}
