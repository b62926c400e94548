// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent token -> {SSE subscribers} fan-out of Gateway push events, with
//! translation of raw protocol frames into the stable [`PushEvent`] schema
//! and health-checked re-subscription on WS drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::http::auth::redact;
use crate::pool::ConnectionPool;
use crate::rpc::{EventSubscription, RpcClient};
use crate::rpc::protocol::EventFrame;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const BROADCAST_CAPACITY: usize = 256;

/// The stable schema fanned out to browsers, translated from raw Gateway
/// push-event frames. Any upstream frame that matches none of the
/// translation rules produces no [`PushEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushEvent {
    #[serde(rename = "chunk")]
    Chunk {
        #[serde(rename = "sessionKey")]
        session_key: String,
        text: String,
    },
    #[serde(rename = "agent-start")]
    AgentStart {
        #[serde(rename = "sessionKey")]
        session_key: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    #[serde(rename = "agent-end")]
    AgentEnd {
        #[serde(rename = "sessionKey")]
        session_key: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    #[serde(rename = "message-final")]
    MessageFinal {
        #[serde(rename = "sessionKey")]
        session_key: String,
        message: Value,
    },
    #[serde(rename = "keepalive")]
    Keepalive { ts: i64 },
}

/// Translate one raw Gateway event frame into the stable [`PushEvent`]
/// schema. Kept as a single function so Gateway schema drift only needs one
/// edit; reused by both the persistent forwarder and `StreamingSend`'s
/// inline filter.
pub fn translate(frame: &EventFrame) -> Option<PushEvent> {
    let payload = frame.event_payload();
    let session_key = payload.get("sessionKey").and_then(Value::as_str)?.to_owned();

    match frame.event_name().as_str() {
        "agent" => match payload.get("stream").and_then(Value::as_str) {
            Some("assistant") => {
                let delta = payload.get("data")?.get("delta")?;
                let text = match delta {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some(PushEvent::Chunk { session_key, text })
            }
            Some("lifecycle") => {
                let phase = payload.get("data")?.get("phase").and_then(Value::as_str)?;
                let run_id =
                    payload.get("data")?.get("runId").and_then(Value::as_str).map(str::to_owned);
                match phase {
                    "start" => Some(PushEvent::AgentStart { session_key, run_id }),
                    "end" => Some(PushEvent::AgentEnd { session_key, run_id }),
                    _ => None,
                }
            }
            _ => None,
        },
        "chat" => {
            if payload.get("state").and_then(Value::as_str) == Some("final") {
                let message = payload.get("message").cloned().unwrap_or(payload.clone());
                Some(PushEvent::MessageFinal { session_key, message })
            } else {
                None
            }
        }
        _ => None,
    }
}

struct ForwarderEntry {
    push_tx: broadcast::Sender<PushEvent>,
    subscriber_count: AtomicUsize,
    gateway_subscription: Mutex<Option<EventSubscription>>,
    client: Mutex<Option<Arc<RpcClient>>>,
    cancel: CancellationToken,
}

/// Persistent, token-keyed fan-out of Gateway push events to SSE subscribers.
pub struct EventForwarder {
    pool: Arc<ConnectionPool>,
    entries: RwLock<HashMap<String, Arc<ForwarderEntry>>>,
}

impl EventForwarder {
    pub fn new(pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self { pool, entries: RwLock::new(HashMap::new()) })
    }

    /// Register a new subscriber for `token`. On the first subscriber, starts
    /// the Gateway event subscription and the health-check loop; additional
    /// subscribers just join the existing broadcast.
    pub async fn subscribe(self: &Arc<Self>, token: &str) -> ForwarderSubscription {
        let entry = self.get_or_create_entry(token).await;
        entry.subscriber_count.fetch_add(1, Ordering::SeqCst);
        let rx = entry.push_tx.subscribe();
        ForwarderSubscription {
            forwarder: Arc::clone(self),
            token: token.to_owned(),
            rx,
        }
    }

    async fn get_or_create_entry(self: &Arc<Self>, token: &str) -> Arc<ForwarderEntry> {
        if let Some(entry) = self.entries.read().await.get(token) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(token) {
            return Arc::clone(entry);
        }

        let (push_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let entry = Arc::new(ForwarderEntry {
            push_tx,
            subscriber_count: AtomicUsize::new(0),
            gateway_subscription: Mutex::new(None),
            client: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        entries.insert(token.to_owned(), Arc::clone(&entry));
        drop(entries);

        self.spawn_health_loop(token.to_owned(), Arc::clone(&entry));
        self.spawn_keepalive_loop(Arc::clone(&entry));

        entry
    }

    async fn unsubscribe(self: &Arc<Self>, token: &str) {
        let entry = match self.entries.read().await.get(token) {
            Some(e) => Arc::clone(e),
            None => return,
        };
        let remaining = entry.subscriber_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut entries = self.entries.write().await;
            // Re-check under the write lock: another subscriber may have
            // joined between the fetch_sub above and acquiring this lock.
            if entry.subscriber_count.load(Ordering::SeqCst) == 0 {
                entries.remove(token);
                drop(entries);
                entry.cancel.cancel();
                if let (Some(sub), Some(client)) = (
                    entry.gateway_subscription.lock().await.take(),
                    entry.client.lock().await.take(),
                ) {
                    client.unsubscribe(sub).await;
                }
            }
        }
    }

    /// Attach (or re-attach) the Gateway event subscription for `token`.
    /// Failure is swallowed: the caller keeps retrying on the health-check
    /// cadence so transient Gateway outages never surface to subscribers.
    async fn ensure_listener(&self, token: &str, entry: &Arc<ForwarderEntry>) {
        if entry.client.lock().await.is_some() {
            return;
        }
        let client = match self.pool.get_connection(token).await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(token = %redact(token), error = %e, "forwarder attach failed");
                return;
            }
        };

        let push_tx = entry.push_tx.clone();
        let subscription = client
            .subscribe_event("*", move |frame| {
                if let Some(event) = translate(frame) {
                    let _ = push_tx.send(event);
                }
            })
            .await;

        *entry.gateway_subscription.lock().await = Some(subscription);
        *entry.client.lock().await = Some(client);
    }

    fn spawn_health_loop(self: &Arc<Self>, token: String, entry: Arc<ForwarderEntry>) {
        let forwarder = Arc::clone(self);
        let cancel = entry.cancel.clone();
        tokio::spawn(async move {
            forwarder.ensure_listener(&token, &entry).await;
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let healthy = match entry.client.lock().await.as_ref() {
                            Some(client) => client.is_connected().await,
                            None => false,
                        };
                        if !healthy {
                            *entry.gateway_subscription.lock().await = None;
                            *entry.client.lock().await = None;
                            forwarder.ensure_listener(&token, &entry).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_keepalive_loop(self: &Arc<Self>, entry: Arc<ForwarderEntry>) {
        let cancel = entry.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let _ = entry.push_tx.send(PushEvent::Keepalive { ts: epoch_millis() });
                    }
                }
            }
        });
    }
}

/// An active subscription to one token's push-event stream. Dropping it
/// releases the subscriber slot; when the last subscriber for a token drops,
/// the forwarder tears down its Gateway event subscription.
pub struct ForwarderSubscription {
    forwarder: Arc<EventForwarder>,
    token: String,
    rx: broadcast::Receiver<PushEvent>,
}

impl ForwarderSubscription {
    pub async fn recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ForwarderSubscription {
    fn drop(&mut self) {
        let forwarder = Arc::clone(&self.forwarder);
        let token = self.token.clone();
        tokio::spawn(async move {
            forwarder.unsubscribe(&token).await;
        });
    }
}

fn epoch_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
#[path = "forwarder_tests.rs"]
mod tests;
