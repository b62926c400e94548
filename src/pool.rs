// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-keyed pool of [`RpcClient`]s with TTL, concurrency-safe lazy
//! creation, and failure invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::rpc::{RpcClient, RpcClientOptions};

/// How long a pool entry stays valid before a new caller forces a fresh handshake.
const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);

struct PoolEntry {
    client: Arc<RpcClient>,
    created_at: Instant,
}

/// Token -> `RpcClient` map with TTL, concurrent creation, and invalidation.
pub struct ConnectionPool {
    entries: RwLock<HashMap<String, PoolEntry>>,
    options: PoolOptions,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub ws_url: String,
    pub origin: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub tls_verify: bool,
    pub instance_id: Option<String>,
}

impl PoolOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            ws_url: config.gateway_ws_url.clone(),
            origin: non_empty(&config.gateway_ws_origin),
            client_id: config.gateway_client_id.clone(),
            client_version: config.gateway_client_version.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            tls_verify: config.tls_verify,
            instance_id: config.gateway_client_instance_id.clone(),
        }
    }

    /// Build per-connection options. Reconnect is always disabled for pooled
    /// clients: the pool re-creates the entry on demand instead.
    fn rpc_options(&self, heartbeat: Duration) -> RpcClientOptions {
        RpcClientOptions {
            ws_url: self.ws_url.clone(),
            origin: self.origin.clone(),
            client_id: self.client_id.clone(),
            client_version: self.client_version.clone(),
            instance_id: self.instance_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            heartbeat_interval: heartbeat,
            reconnect_max_retries: 0,
            reconnect_delay: Duration::from_millis(0),
            tls_verify: self.tls_verify,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self { entries: RwLock::new(HashMap::new()), options }
    }

    /// Acquire the pooled connection for `token`, lazily constructing and
    /// handshaking it. Concurrent callers for the same token observe the same
    /// in-flight handshake and share its result: the existence check and the
    /// entry insert happen under one write-lock hold, so two racing callers
    /// with no prior entry can never both win the construction.
    ///
    /// A non-expired entry whose client has died in the background (the
    /// Gateway dropped the WS; pooled clients never self-reconnect) is
    /// invalidated and rebuilt within this same call, per §4.2 step 1
    /// ("invalidate this entry and proceed") — the caller never sees a
    /// `GATEWAY_CONNECT_FAILED` for a connection that simply needs
    /// re-handshaking. A freshly built client that itself fails to connect
    /// still propagates its error immediately; only one rebuild is attempted
    /// per call.
    pub async fn get_connection(&self, token: &str) -> Result<Arc<RpcClient>, GatewayError> {
        loop {
            let mut stale = None;
            let (client, reused_cached) = {
                let mut entries = self.entries.write().await;
                match entries.get(token) {
                    Some(entry) if entry.created_at.elapsed() < ENTRY_TTL => {
                        (Arc::clone(&entry.client), true)
                    }
                    _ => {
                        if let Some(old) = entries.remove(token) {
                            stale = Some(old.client);
                        }
                        let client = RpcClient::new(
                            token.to_owned(),
                            self.options.rpc_options(self.options.heartbeat_interval),
                        );
                        entries.insert(
                            token.to_owned(),
                            PoolEntry { client: Arc::clone(&client), created_at: Instant::now() },
                        );
                        (client, false)
                    }
                }
            };
            if let Some(old_client) = stale {
                old_client.close().await;
            }

            let outcome = client.connect().await;
            if matches!(outcome, Ok(())) && client.is_connected().await {
                return Ok(client);
            }

            self.invalidate(token, &client).await;

            let err = match outcome {
                Ok(()) => {
                    GatewayError::gateway_connect_failed("connection dropped before becoming ready")
                }
                Err(e) => e,
            };

            if reused_cached {
                continue;
            }
            return Err(err);
        }
    }

    /// Remove the pool entry for `token` only if it still points at `client`
    /// (a concurrent invalidation or a fresh handshake may have already
    /// replaced it), then close it. Exposed so callers who learn a pooled
    /// client is no longer usable (e.g. `SessionManager` on an `UNAUTHORIZED`
    /// per-request error, spec.md §8 scenario 6) can force the next
    /// `get_connection` to re-handshake instead of waiting out the TTL.
    pub async fn invalidate(&self, token: &str, client: &Arc<RpcClient>) {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(token) {
                Some(entry) if Arc::ptr_eq(&entry.client, client) => entries.remove(token),
                _ => None,
            }
        };
        if removed.is_some() {
            client.close().await;
        }
    }

    /// Build a one-shot, unpooled client purely to validate a token. Always
    /// closed afterward regardless of outcome.
    pub async fn verify_token(&self, token: &str) -> Result<bool, GatewayError> {
        let client =
            RpcClient::new(token.to_owned(), self.options.rpc_options(Duration::from_millis(0)));
        let result = client.connect().await;
        client.close().await;
        match result {
            Ok(()) => Ok(true),
            Err(GatewayError::Unauthorized) => Ok(false),
            Err(other) => Err(other),
        }
    }

    pub async fn close_token(&self, token: &str) {
        let entry = self.entries.write().await.remove(token);
        if let Some(entry) = entry {
            entry.client.close().await;
        }
    }

    pub async fn close_all(&self) {
        let entries = {
            let mut guard = self.entries.write().await;
            std::mem::take(&mut *guard)
        };
        for (_, entry) in entries {
            entry.client.close().await;
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
