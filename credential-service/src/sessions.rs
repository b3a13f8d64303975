use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use common_auth::{AuthError, AuthResult};
use rand_core::{OsRng, RngCore};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::config::SessionStoreConfig;

pub type SessionData = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub data: SessionData,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// TTL-bound session storage. Reads never extend a session's lifetime; only
/// `create` sets the expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, id: &str, data: SessionData, ttl: Duration) -> AuthResult<Session>;
    async fn get(&self, id: &str) -> AuthResult<Option<Session>>;
    async fn delete(&self, id: &str) -> AuthResult<()>;
    /// Reads and deletes in one step. Of several concurrent callers at most
    /// one receives the session.
    async fn take(&self, id: &str) -> AuthResult<Option<Session>>;
}

/// 256 bits of OS randomness, URL-safe.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn expiry_after(ttl: Duration) -> AuthResult<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| AuthError::SessionStore(format!("session TTL {ttl:?} out of range")))
}

// ---------------- Redis Implementation ----------------

#[derive(Serialize, Deserialize)]
struct StoredSession {
    data: SessionData,
    expires_at: DateTime<Utc>,
}

pub struct RedisSessionStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    prefix: String,
    timeout: Duration,
}

impl RedisSessionStore {
    /// Validates the URL only; the connection is opened on first use so that
    /// an unreachable store degrades requests instead of blocking startup.
    pub fn new(config: &SessionStoreConfig) -> AuthResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|err| AuthError::SessionStore(format!("invalid Redis URL: {err}")))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            prefix: config.key_prefix.clone(),
            timeout: config.timeout,
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    async fn connection(&self) -> AuthResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|err| AuthError::SessionStore(format!("cannot connect to Redis: {err}")))?;
        Ok(manager.clone())
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::SessionStore(format!(
                "{op} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

fn redis_err(op: &'static str) -> impl Fn(redis::RedisError) -> AuthError {
    move |err| AuthError::SessionStore(format!("{op} failed: {err}"))
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, id: &str, data: SessionData, ttl: Duration) -> AuthResult<Session> {
        let expires_at = expiry_after(ttl)?;
        let record = StoredSession {
            data,
            expires_at,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| AuthError::SessionStore(format!("cannot encode session: {err}")))?;
        let key = self.key(id);
        let seconds = ttl.as_secs().max(1);

        self.bounded("create", async {
            let mut conn = self.connection().await?;
            redis::cmd("SET")
                .arg(&key)
                .arg(&payload)
                .arg("EX")
                .arg(seconds)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(redis_err("create"))
        })
        .await?;

        Ok(Session {
            id: id.to_string(),
            data: record.data,
            expires_at,
        })
    }

    async fn get(&self, id: &str) -> AuthResult<Option<Session>> {
        let key = self.key(id);
        let raw: Option<String> = self
            .bounded("get", async {
                let mut conn = self.connection().await?;
                conn.get::<_, Option<String>>(&key)
                    .await
                    .map_err(redis_err("get"))
            })
            .await?;

        raw.map(|raw| decode_session(id, &raw)).transpose()
    }

    async fn take(&self, id: &str) -> AuthResult<Option<Session>> {
        let key = self.key(id);
        let raw: Option<String> = self
            .bounded("take", async {
                let mut conn = self.connection().await?;
                redis::cmd("GETDEL")
                    .arg(&key)
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
                    .map_err(redis_err("take"))
            })
            .await?;

        raw.map(|raw| decode_session(id, &raw)).transpose()
    }

    async fn delete(&self, id: &str) -> AuthResult<()> {
        let key = self.key(id);
        self.bounded("delete", async {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(&key).await.map_err(redis_err("delete"))
        })
        .await
    }
}

fn decode_session(id: &str, raw: &str) -> AuthResult<Session> {
    let record: StoredSession = serde_json::from_str(raw)
        .map_err(|err| AuthError::SessionStore(format!("cannot decode session: {err}")))?;
    Ok(Session {
        id: id.to_string(),
        data: record.data,
        expires_at: record.expires_at,
    })
}

// ---------------- In-Memory Implementation ----------------

struct MemoryEntry {
    session: Session,
    deadline: Instant,
}

/// Process-local store driven by the tokio clock; used by tests and local runs.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().await;
        guard.values().filter(|entry| entry.deadline > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, id: &str, data: SessionData, ttl: Duration) -> AuthResult<Session> {
        let session = Session {
            id: id.to_string(),
            data,
            expires_at: expiry_after(ttl)?,
        };
        let entry = MemoryEntry {
            session: session.clone(),
            deadline: Instant::now() + ttl,
        };
        self.inner.lock().await.insert(id.to_string(), entry);
        Ok(session)
    }

    async fn get(&self, id: &str) -> AuthResult<Option<Session>> {
        let mut guard = self.inner.lock().await;
        let expired = match guard.get(id) {
            Some(entry) if Instant::now() < entry.deadline => {
                return Ok(Some(entry.session.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.remove(id);
        }
        Ok(None)
    }

    async fn delete(&self, id: &str) -> AuthResult<()> {
        self.inner.lock().await.remove(id);
        Ok(())
    }

    async fn take(&self, id: &str) -> AuthResult<Option<Session>> {
        let entry = self.inner.lock().await.remove(id);
        Ok(entry
            .filter(|entry| Instant::now() < entry.deadline)
            .map(|entry| entry.session))
    }
}
