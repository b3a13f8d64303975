use anyhow::{anyhow, bail, Context, Result};
use common_auth::{ClassIdentifiers, JwtConfig, TokenClass, DEFAULT_ISSUER};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::tokens::TokenConfig;

const MIN_COOKIE_SECRET_BYTES: usize = 16;
/// Upper bound for token and session lifetimes.
const MAX_TTL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSameSite {
    Lax,
    Strict,
    None,
}

impl CookieSameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookieSameSite::Lax => "Lax",
            CookieSameSite::Strict => "Strict",
            CookieSameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub identifiers: ClassIdentifiers,
    pub key_dir: PathBuf,
    pub leeway_seconds: u32,
}

impl JwtSettings {
    pub fn ttl(&self, class: TokenClass) -> Duration {
        match class {
            TokenClass::Access => self.access_ttl,
            TokenClass::Refresh => self.refresh_ttl,
        }
    }

    pub fn jwt_config(&self) -> JwtConfig {
        JwtConfig::new(&self.issuer, &self.audience).with_leeway(self.leeway_seconds)
    }

    pub fn token_config(&self) -> Result<TokenConfig> {
        Ok(TokenConfig {
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            access_ttl_seconds: i64::try_from(self.access_ttl.as_secs())
                .context("Access token TTL does not fit in i64 seconds")?,
            refresh_ttl_seconds: i64::try_from(self.refresh_ttl.as_secs())
                .context("Refresh token TTL does not fit in i64 seconds")?,
        })
    }
}

#[derive(Clone)]
pub struct CookieConfig {
    pub name: String,
    pub secret: String,
    pub same_site: CookieSameSite,
    pub http_only: bool,
    pub secure: bool,
}

impl std::fmt::Debug for CookieConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieConfig")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("same_site", &self.same_site)
            .field("http_only", &self.http_only)
            .field("secure", &self.secure)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    pub trust_proxy: bool,
    pub jwt: JwtSettings,
    pub cookie: CookieConfig,
    pub session_store: SessionStoreConfig,
    pub tls: TlsConfig,
}

pub fn load_service_config() -> Result<ServiceConfig> {
    ServiceConfig::from_lookup(|key| env::var(key).ok())
}

impl ServiceConfig {
    /// Builds the configuration from an arbitrary key lookup (the process
    /// environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).and_then(|value| normalize_optional(&value));

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let http_port = parse_port(var("PORT"), 80).context("Failed to parse PORT")?;
        let https_port =
            parse_port(var("HTTPS_PORT"), 443).context("Failed to parse HTTPS_PORT")?;
        let trust_proxy = var("TRUST_PROXY").map(|v| is_truthy(&v)).unwrap_or(false);

        let access_ttl = parse_ttl(var("JWT_ACCESS_TOKEN_TTL"), "15m")
            .context("Failed to parse JWT_ACCESS_TOKEN_TTL")?;
        let refresh_ttl = parse_ttl(var("JWT_REFRESH_TOKEN_TTL"), "7d")
            .context("Failed to parse JWT_REFRESH_TOKEN_TTL")?;
        if refresh_ttl < access_ttl {
            bail!("JWT_REFRESH_TOKEN_TTL must not be shorter than JWT_ACCESS_TOKEN_TTL");
        }

        let identifiers = ClassIdentifiers::new(
            var("JWT_ACCESS_TOKEN_FLAG").unwrap_or_else(|| TokenClass::Access.as_str().into()),
            var("JWT_REFRESH_TOKEN_FLAG").unwrap_or_else(|| TokenClass::Refresh.as_str().into()),
        );
        validate_identifier(&identifiers.access).context("Invalid JWT_ACCESS_TOKEN_FLAG")?;
        validate_identifier(&identifiers.refresh).context("Invalid JWT_REFRESH_TOKEN_FLAG")?;
        if identifiers.access == identifiers.refresh {
            bail!("Access and refresh token flags must differ");
        }

        let leeway_seconds = var("JWT_LEEWAY_SECONDS")
            .map(|value| value.parse::<u32>())
            .transpose()
            .context("Failed to parse JWT_LEEWAY_SECONDS")?
            .unwrap_or(30);

        let jwt = JwtSettings {
            issuer: var("JWT_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            audience: var("JWT_AUDIENCE").unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            access_ttl,
            refresh_ttl,
            identifiers,
            key_dir: var("JWT_KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("certificate/jwt")),
            leeway_seconds,
        };

        let secret = var("COOKIE_SECRET").ok_or_else(|| anyhow!("COOKIE_SECRET must be set"))?;
        if secret.len() < MIN_COOKIE_SECRET_BYTES {
            bail!("COOKIE_SECRET must be at least {MIN_COOKIE_SECRET_BYTES} bytes");
        }
        let same_site = var("COOKIE_SAME_SITE")
            .map(|value| parse_same_site(&value))
            .transpose()
            .context("Failed to parse COOKIE_SAME_SITE")?
            .unwrap_or(CookieSameSite::Strict);
        let cookie = CookieConfig {
            name: var("COOKIE_NAME").unwrap_or_else(|| "sid".to_string()),
            secret,
            same_site,
            http_only: var("COOKIE_HTTP_ONLY").map(|v| is_truthy(&v)).unwrap_or(false),
            secure: var("COOKIE_SECURE").map(|v| is_truthy(&v)).unwrap_or(false),
        };

        let timeout_ms = var("SESSION_STORE_TIMEOUT_MS")
            .map(|value| value.parse::<u64>())
            .transpose()
            .context("Failed to parse SESSION_STORE_TIMEOUT_MS")?
            .unwrap_or(2_000);
        let session_store = SessionStoreConfig {
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            key_prefix: var("SESSION_KEY_PREFIX").unwrap_or_else(|| "sess".to_string()),
            timeout: Duration::from_millis(timeout_ms.max(1)),
        };

        let tls = TlsConfig {
            cert_path: var("TLS_CERT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("certificate/https/cert.pem")),
            key_path: var("TLS_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("certificate/https/key.pem")),
        };

        Ok(ServiceConfig {
            host,
            http_port,
            https_port,
            trust_proxy,
            jwt,
            cookie,
            session_store,
            tls,
        })
    }
}

/// Token lifetimes are carried in whole seconds (`exp`, `Max-Age`, `EX`), so
/// anything finer or beyond [`MAX_TTL`] is refused here.
fn parse_ttl(value: Option<String>, default: &str) -> Result<Duration> {
    let raw = value.as_deref().unwrap_or(default);
    let ttl = parse_duration(raw)?;
    if ttl.subsec_nanos() != 0 {
        bail!("Duration '{raw}' must be a whole number of seconds");
    }
    if ttl > MAX_TTL {
        bail!(
            "Duration '{raw}' exceeds the maximum of {} days",
            MAX_TTL.as_secs() / 86_400
        );
    }
    Ok(ttl)
}

/// Parses `900`, `900s`, `15m`, `12h`, `7d`, `1w` or `250ms`. A bare number
/// counts as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        bail!("Duration '{trimmed}' must start with a number");
    }
    let amount: u64 = digits
        .parse()
        .map_err(|err| anyhow!("Invalid duration '{trimmed}': {err}"))?;

    let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" => return non_zero(Duration::from_millis(amount), trimmed),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        other => bail!("Unsupported duration unit '{other}' in '{trimmed}'"),
    };
    let seconds = amount
        .checked_mul(seconds_per_unit)
        .ok_or_else(|| anyhow!("Duration '{trimmed}' is too large"))?;
    non_zero(Duration::from_secs(seconds), trimmed)
}

fn non_zero(duration: Duration, raw: &str) -> Result<Duration> {
    if duration.is_zero() {
        bail!("Duration '{raw}' must be positive");
    }
    Ok(duration)
}

fn parse_port(value: Option<String>, default: u16) -> Result<u16> {
    match value {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|err| anyhow!("Invalid port '{raw}': {err}")),
        None => Ok(default),
    }
}

fn validate_identifier(value: &str) -> Result<()> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!(
            "Identifier '{value}' may only contain ASCII letters, digits, '-' and '_'"
        ))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_same_site(value: &str) -> Result<CookieSameSite> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lax" => Ok(CookieSameSite::Lax),
        "strict" | "true" => Ok(CookieSameSite::Strict),
        "none" => Ok(CookieSameSite::None),
        other => Err(anyhow!(
            "Unsupported cookie same-site policy '{other}'. Use Lax, Strict, or None."
        )),
    }
}
