// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Business operations expressed as Gateway RPC calls, with in-memory
//! per-token caches for the session list and the archive set.

pub mod stream;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::pool::ConnectionPool;
use crate::rpc::RpcClient;

/// How long a cached session may sit idle before `gc_idle` may reap it.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "createdAt")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "updatedAt")]
    pub updated_at: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded payload, carried as-is in RPC params.
    pub bytes: String,
}

/// Per-token cached session metadata.
#[derive(Debug, Clone)]
struct CachedSession {
    title: Option<String>,
    created_at: Option<String>,
    last_active_at: std::time::Instant,
}

struct TokenState {
    sessions: HashMap<String, CachedSession>,
    archive: HashSet<String>,
}

impl TokenState {
    fn new() -> Self {
        Self { sessions: HashMap::new(), archive: HashSet::new() }
    }
}

/// Pure business layer over [`ConnectionPool`].
pub struct SessionManager {
    pool: Arc<ConnectionPool>,
    tokens: tokio::sync::RwLock<HashMap<String, Arc<Mutex<TokenState>>>>,
}

impl SessionManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool, tokens: tokio::sync::RwLock::new(HashMap::new()) }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn token_state(&self, token: &str) -> Arc<Mutex<TokenState>> {
        if let Some(state) = self.tokens.read().await.get(token) {
            return Arc::clone(state);
        }
        let mut tokens = self.tokens.write().await;
        Arc::clone(
            tokens.entry(token.to_owned()).or_insert_with(|| Arc::new(Mutex::new(TokenState::new()))),
        )
    }

    /// Issue one RPC through the token's pooled connection. On an
    /// `UNAUTHORIZED` response the pool entry is invalidated so the next
    /// call re-handshakes instead of reusing a client the Gateway has
    /// already revoked (spec.md §8 scenario 6).
    async fn call(
        &self,
        token: &str,
        client: &Arc<RpcClient>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let result = client.request(method, params).await;
        if let Err(GatewayError::Unauthorized) = &result {
            self.pool.invalidate(token, client).await;
        }
        result
    }

    pub async fn list(&self, token: &str) -> Result<Vec<Session>, GatewayError> {
        let client = self.pool.get_connection(token).await?;
        let result = self.call(token, &client, "sessions.list", None).await?;
        let mut sessions = normalize_sessions(&result);

        let state = self.token_state(token).await;
        let guard = state.lock().await;
        for session in &mut sessions {
            session.archived = guard.archive.contains(&session.key);
        }
        Ok(sessions)
    }

    pub async fn create(&self, token: &str, title: Option<String>) -> Result<Session, GatewayError> {
        let key = format!("webchat-{}", epoch_millis());
        let client = self.pool.get_connection(token).await?;
        self.call(token, &client, "sessions.reset", Some(json!({ "key": key }))).await?;

        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        guard.sessions.insert(
            key.clone(),
            CachedSession {
                title: title.clone(),
                created_at: Some(now_iso()),
                last_active_at: std::time::Instant::now(),
            },
        );

        Ok(Session {
            key,
            title,
            created_at: Some(now_iso()),
            updated_at: None,
            archived: false,
        })
    }

    pub async fn history(&self, token: &str, key: &str) -> Result<Vec<Message>, GatewayError> {
        let client = self.pool.get_connection(token).await?;
        let result = self
            .call(token, &client, "chat.history", Some(json!({ "sessionKey": key, "limit": 200 })))
            .await?;
        self.touch(token, key).await;
        Ok(normalize_messages(key, &result))
    }

    pub async fn send(
        &self,
        token: &str,
        key: &str,
        text: &str,
        images: Vec<ImageAttachment>,
    ) -> Result<Value, GatewayError> {
        let client = self.pool.get_connection(token).await?;
        let params = send_params(key, text, &images);
        let result = self.call(token, &client, "chat.send", Some(params)).await?;
        self.touch(token, key).await;
        Ok(result)
    }

    pub async fn rename(&self, token: &str, key: &str, title: &str) -> Result<(), GatewayError> {
        let client = self.pool.get_connection(token).await?;
        self.call(token, &client, "sessions.patch", Some(json!({ "key": key, "label": title })))
            .await?;

        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        guard
            .sessions
            .entry(key.to_owned())
            .or_insert_with(|| CachedSession {
                title: None,
                created_at: None,
                last_active_at: std::time::Instant::now(),
            })
            .title = Some(title.to_owned());
        Ok(())
    }

    pub async fn archive(&self, token: &str, key: &str) {
        let state = self.token_state(token).await;
        state.lock().await.archive.insert(key.to_owned());
    }

    pub async fn unarchive(&self, token: &str, key: &str) {
        let state = self.token_state(token).await;
        state.lock().await.archive.remove(key);
    }

    pub async fn close(&self, token: &str, key: &str) -> Result<(), GatewayError> {
        let client = self.pool.get_connection(token).await?;
        self.call(token, &client, "sessions.delete", Some(json!({ "key": key }))).await?;

        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        guard.sessions.remove(key);
        guard.archive.remove(key);
        Ok(())
    }

    pub async fn delete_many(&self, token: &str, keys: &[String]) -> Result<(), GatewayError> {
        let client = self.pool.get_connection(token).await?;
        self.call(token, &client, "sessions.deleteMany", Some(json!({ "keys": keys }))).await?;

        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        for key in keys {
            guard.sessions.remove(key);
            guard.archive.remove(key);
        }
        Ok(())
    }

    /// Drop cached session entries idle longer than `threshold`. Has no
    /// effect on the Gateway; purely local cache hygiene.
    pub async fn gc_idle(&self, token: &str, threshold: Duration) {
        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        guard.sessions.retain(|_, cached| cached.last_active_at.elapsed() < threshold);
    }

    async fn touch(&self, token: &str, key: &str) {
        let state = self.token_state(token).await;
        let mut guard = state.lock().await;
        guard
            .sessions
            .entry(key.to_owned())
            .or_insert_with(|| CachedSession {
                title: None,
                created_at: None,
                last_active_at: std::time::Instant::now(),
            })
            .last_active_at = std::time::Instant::now();
    }
}

/// Build the `chat.send` params: session key, text, idempotency key, and
/// deliver-and-wait semantics, plus any attachments.
fn send_params(key: &str, text: &str, images: &[ImageAttachment]) -> Value {
    json!({
        "sessionKey": key,
        "message": text,
        "deliver": true,
        "idempotencyKey": Uuid::new_v4().to_string(),
        "attachments": images,
    })
}

/// Normalize an upstream `sessions.list` result, accepting either a bare
/// array or `{ sessions: [...] }`, and either `sessionKey`/`key` and
/// `title`/`label` field names.
fn normalize_sessions(value: &Value) -> Vec<Session> {
    let array = extract_array(value, "sessions");
    array
        .iter()
        .map(|entry| Session {
            key: entry
                .get("sessionKey")
                .or_else(|| entry.get("key"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            title: entry
                .get("title")
                .or_else(|| entry.get("label"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            created_at: entry
                .get("createdAt")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| Some(now_iso())),
            updated_at: entry
                .get("updatedAt")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| Some(now_iso())),
            archived: false,
        })
        .collect()
}

/// Normalize an upstream `chat.history` result, accepting either a bare
/// array or `{ messages: [...] }`.
fn normalize_messages(session_key: &str, value: &Value) -> Vec<Message> {
    let array = extract_array(value, "messages");
    array
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let role = match entry.get("role").and_then(Value::as_str) {
                Some("user") => Role::User,
                Some("system") => Role::System,
                _ => Role::Assistant,
            };
            let text = entry
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| text_from_content_blocks(entry));
            let created_at = entry
                .get("createdAt")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(now_iso);
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{session_key}-{index}-{}", epoch_millis()));

            Message { id, session_key: session_key.to_owned(), role, text, created_at }
        })
        .collect()
}

fn text_from_content_blocks(entry: &Value) -> Option<String> {
    let blocks = entry.get("content")?.as_array()?;
    let joined = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn extract_array<'a>(value: &'a Value, wrapper_key: &str) -> Vec<&'a Value> {
    if let Some(array) = value.as_array() {
        return array.iter().collect();
    }
    value.get(wrapper_key).and_then(Value::as_array).map(|a| a.iter().collect()).unwrap_or_default()
}

/// Render the current time as an ISO-8601 UTC timestamp. The Gateway
/// contract only ever needs this for synthesized defaults (upstream-supplied
/// timestamps pass through as-is), so a small hand-rolled formatter avoids
/// pulling in a full datetime crate the rest of the bridge has no other use
/// for.
pub(crate) fn now_iso() -> String {
    let millis = epoch_millis();
    let secs = millis / 1000;
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let (y, mo, d) = civil_from_days(days);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
}

/// Howard Hinnant's days-from-civil algorithm, inverted: days since epoch to
/// (year, month, day).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn epoch_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
