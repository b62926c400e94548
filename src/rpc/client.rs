// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One WebSocket connection to the Gateway: handshake, request/response
//! correlation, heartbeat, event dispatch, and reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::rpc::protocol::{ConnectParams, EventFrame, FrameKind, ResponseFrame};
use crate::tls;

/// Options controlling one `RpcClient`'s behavior, derived from `GatewayConfig`
/// but independently settable so the pool and `verifyToken` can disable
/// reconnect/heartbeat per use.
#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub ws_url: String,
    pub origin: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub instance_id: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Zero disables the heartbeat entirely.
    pub heartbeat_interval: Duration,
    pub reconnect_max_retries: u32,
    pub reconnect_delay: Duration,
    pub tls_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    HandshakePending,
    Ready,
    Closed,
}

type EventCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;

/// Opaque handle returned by [`RpcClient::subscribe_event`]. Dropping it does
/// not unsubscribe; call [`EventSubscription::unsubscribe`] explicitly.
pub struct EventSubscription {
    bus: Arc<EventBusInner>,
    name: String,
    id: u64,
}

impl EventSubscription {
    pub async fn unsubscribe(self) {
        self.bus.unsubscribe(&self.name, self.id).await;
    }
}

struct EventBusInner {
    named: Mutex<HashMap<String, Vec<(u64, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventBusInner {
    fn new() -> Self {
        Self { named: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    async fn subscribe(self: &Arc<Self>, name: &str, cb: EventCallback) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.named.lock().await.entry(name.to_owned()).or_default().push((id, cb));
        EventSubscription { bus: Arc::clone(self), name: name.to_owned(), id }
    }

    async fn unsubscribe(&self, name: &str, id: u64) {
        let mut named = self.named.lock().await;
        if let Some(list) = named.get_mut(name) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                named.remove(name);
            }
        }
    }

    /// Dispatch one event frame to every exact-match subscriber for its name
    /// and every wildcard (`"*"`) subscriber, in registration order.
    async fn dispatch(&self, frame: &EventFrame) {
        let event_name = frame.event_name();
        let named = self.named.lock().await;
        if let Some(list) = named.get(event_name.as_str()) {
            for (_, cb) in list {
                invoke_isolated(cb, frame);
            }
        }
        if event_name != "*" {
            if let Some(list) = named.get("*") {
                for (_, cb) in list {
                    invoke_isolated(cb, frame);
                }
            }
        }
    }
}

/// Invoke a callback, isolating panics so one bad subscriber cannot poison
/// dispatch for the others.
fn invoke_isolated(cb: &EventCallback, frame: &EventFrame) {
    let cb = Arc::clone(cb);
    let frame = frame.clone();
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&frame))).is_err() {
        tracing::warn!("event subscriber panicked; isolated");
    }
}

enum ConnectGate {
    NotStarted,
    InFlight(Vec<oneshot::Sender<Result<(), GatewayError>>>),
    Done(Result<(), GatewayError>),
}

/// One WebSocket connection to the Gateway.
///
/// Construct with [`RpcClient::new`], then call [`RpcClient::connect`].
/// Concurrent `connect()` callers on the same instance share the one
/// in-flight handshake.
pub struct RpcClient {
    token: String,
    opts: RpcClientOptions,
    state: RwLock<ClientState>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, GatewayError>>>>,
    events: Arc<EventBusInner>,
    last_pong_at_ms: AtomicI64,
    connect_gate: Mutex<ConnectGate>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Live connection halves handed off from `dial_and_handshake` to
    /// `serve_forever`, which owns them for the duration of one connection.
    live: Mutex<Option<(WsWriteHalf, WsReadHalf, mpsc::UnboundedReceiver<Message>)>>,
    cancel: CancellationToken,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient").field("ws_url", &self.opts.ws_url).finish()
    }
}

impl RpcClient {
    pub fn new(token: String, opts: RpcClientOptions) -> Arc<Self> {
        Arc::new(Self {
            token,
            opts,
            state: RwLock::new(ClientState::Idle),
            pending: Mutex::new(HashMap::new()),
            events: Arc::new(EventBusInner::new()),
            last_pong_at_ms: AtomicI64::new(0),
            connect_gate: Mutex::new(ConnectGate::NotStarted),
            outbound_tx: Mutex::new(None),
            live: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Ready
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn last_pong_at(&self) -> Option<i64> {
        let v = self.last_pong_at_ms.load(Ordering::Relaxed);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }

    /// Open the WS and complete the connect handshake. Concurrent callers
    /// share this one in-flight attempt; subsequent calls return the cached
    /// result.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        enum Role {
            Leader,
            Follower(oneshot::Receiver<Result<(), GatewayError>>),
        }

        let role = {
            let mut gate = self.connect_gate.lock().await;
            match &mut *gate {
                ConnectGate::Done(r) => return r.clone(),
                ConnectGate::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Role::Follower(rx)
                }
                ConnectGate::NotStarted => {
                    *gate = ConnectGate::InFlight(Vec::new());
                    Role::Leader
                }
            }
        };

        match role {
            Role::Follower(rx) => {
                rx.await.unwrap_or_else(|_| Err(GatewayError::internal("handshake dropped")))
            }
            Role::Leader => {
                *self.state.write().await = ClientState::Connecting;
                let result = self.dial_and_handshake().await;

                let waiters = {
                    let mut gate = self.connect_gate.lock().await;
                    match std::mem::replace(&mut *gate, ConnectGate::Done(result.clone())) {
                        ConnectGate::InFlight(w) => w,
                        _ => Vec::new(),
                    }
                };
                for tx in waiters {
                    let _ = tx.send(result.clone());
                }

                match &result {
                    Ok(()) => {
                        *self.state.write().await = ClientState::Ready;
                        let me = Arc::clone(self);
                        tokio::spawn(async move { me.serve_forever().await });
                    }
                    Err(_) => {
                        *self.state.write().await = ClientState::Closed;
                    }
                }
                result
            }
        }
    }

    /// Send one RPC request and await its correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        if !self.is_connected().await {
            return Err(GatewayError::gateway_connect_failed(format!(
                "cannot call {method}: connection not ready"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let frame = super::protocol::RequestFrame::new(id.clone(), method, params);
        let text = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::internal(format!("encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let sent = {
            let guard = self.outbound_tx.lock().await;
            match guard.as_ref() {
                Some(outbound) => outbound.send(Message::Text(text.into())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::gateway_connect_failed(format!(
                "cannot call {method}: socket not open"
            )));
        }

        tracing::trace!(method, id, "rpc request sent");

        match tokio::time::timeout(self.opts.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::gateway_connect_failed("connection closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::gateway_rpc_error(format!(
                    "request {method} timed out after {:?}",
                    self.opts.request_timeout
                )))
            }
        }
    }

    /// Subscribe to every event whose name equals `name`, or every event if
    /// `name == "*"`. The callback runs synchronously from the read loop, so
    /// it must not block.
    pub async fn subscribe_event(
        self: &Arc<Self>,
        name: &str,
        cb: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.events.subscribe(name, Arc::new(cb)).await
    }

    pub async fn unsubscribe(&self, sub: EventSubscription) {
        sub.unsubscribe().await;
    }

    /// Close the client. Terminal: a new instance must be built to reconnect.
    pub async fn close(&self) {
        self.cancel.cancel();
        *self.state.write().await = ClientState::Closed;
        self.reject_all_pending(GatewayError::gateway_connect_failed("client closed")).await;
    }

    async fn reject_all_pending(&self, err: GatewayError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn build_url(&self) -> String {
        let mut url = self.opts.ws_url.clone();
        let sep = if url.contains('?') { '&' } else { '?' };
        url.push(sep);
        url.push_str("token=");
        url.push_str(&percent_encode(&self.token));
        url
    }

    /// Dial the WS and complete the mandatory connect handshake. No other
    /// request may be sent before this returns successfully.
    async fn dial_and_handshake(&self) -> Result<(), GatewayError> {
        *self.state.write().await = ClientState::Connecting;
        let url = self.build_url();

        let mut request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
            url.as_str(),
        )
        .map_err(|e| GatewayError::gateway_connect_failed(format!("bad URL: {e}")))?;
        if let Some(origin) = &self.opts.origin {
            if !origin.is_empty() {
                request
                    .headers_mut()
                    .insert("Origin", origin.parse().map_err(|_| {
                        GatewayError::gateway_connect_failed("invalid Origin header")
                    })?);
            }
        }

        let connector = tls::connector(self.opts.tls_verify);
        let dial = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        let (stream, response) = tokio::time::timeout(self.opts.connect_timeout, dial)
            .await
            .map_err(|_| GatewayError::gateway_connect_failed("connect timed out"))?
            .map_err(|e| classify_connect_error(&e))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::Unauthorized);
        }
        if !status.is_informational() && !status.is_success() && status.as_u16() != 101 {
            return Err(GatewayError::gateway_connect_failed(format!(
                "WS upgrade failed: HTTP {status}"
            )));
        }

        *self.state.write().await = ClientState::HandshakePending;

        let (mut write, mut read) = stream.split();

        let params = ConnectParams::new(
            self.token.clone(),
            self.opts.client_id.clone(),
            self.opts.client_version.clone(),
            self.opts.instance_id.clone(),
        );
        let connect_id = Uuid::new_v4().to_string();
        let frame = super::protocol::RequestFrame::new(
            connect_id.clone(),
            "connect",
            Some(serde_json::to_value(&params).map_err(|e| {
                GatewayError::internal(format!("encode connect params: {e}"))
            })?),
        );
        let text = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::internal(format!("encode connect frame: {e}")))?;

        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::gateway_connect_failed(format!("send connect: {e}")))?;

        let handshake = async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let kind: FrameKind = serde_json::from_str(&text).unwrap_or_default();
                        if kind.id.as_deref() == Some(connect_id.as_str()) {
                            let res: ResponseFrame = serde_json::from_str(&text).map_err(|e| {
                                GatewayError::gateway_connect_failed(format!(
                                    "malformed connect response: {e}"
                                ))
                            })?;
                            return classify_connect_response(&res);
                        }
                        // Any other frame arriving before the connect response is ignored.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        return Err(classify_close_code(code));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(GatewayError::gateway_connect_failed(format!(
                            "WS error during handshake: {e}"
                        )))
                    }
                    None => {
                        return Err(GatewayError::gateway_connect_failed(
                            "WS closed during handshake",
                        ))
                    }
                }
            }
        };

        tokio::time::timeout(self.opts.connect_timeout, handshake)
            .await
            .map_err(|_| GatewayError::gateway_connect_failed("handshake timed out"))??;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound_tx.lock().await = Some(outbound_tx);

        // Hand the live halves to the serving task via a side channel stashed
        // on self; simplest is to store them directly since dial_and_handshake
        // only ever runs from within connect()/serve_forever(), never concurrently.
        self.stash_connection(write, read, outbound_rx).await;

        Ok(())
    }

    async fn stash_connection(
        &self,
        write: WsWriteHalf,
        read: WsReadHalf,
        outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        *self.live.lock().await = Some((write, read, outbound_rx));
    }

    /// Serve the connection established by `dial_and_handshake`, reconnecting
    /// with linear backoff on drop, until the client is closed, retries are
    /// exhausted, or an auth-class failure occurs.
    async fn serve_forever(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            let live = self.live.lock().await.take();
            if let Some((write, read, outbound_rx)) = live {
                self.serve_connection(write, read, outbound_rx).await;
                attempt = 0;
            }

            if self.cancel.is_cancelled() {
                *self.state.write().await = ClientState::Closed;
                return;
            }

            self.reject_all_pending(GatewayError::gateway_connect_failed("connection lost")).await;

            if self.opts.reconnect_max_retries == 0 || attempt >= self.opts.reconnect_max_retries {
                *self.state.write().await = ClientState::Closed;
                return;
            }
            attempt += 1;

            let delay = self.opts.reconnect_delay * attempt;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    *self.state.write().await = ClientState::Closed;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.dial_and_handshake().await {
                Ok(()) => {
                    *self.state.write().await = ClientState::Ready;
                }
                Err(e) if matches!(e, GatewayError::Unauthorized) => {
                    *self.state.write().await = ClientState::Closed;
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    async fn serve_connection(
        &self,
        mut write: WsWriteHalf,
        mut read: WsReadHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let mut heartbeat = self.heartbeat_ticker();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }

                tick = maybe_tick(&mut heartbeat) => {
                    if tick {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            return;
                        }
                    }
                }

                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if write.send(msg).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_incoming_text(&text).await,
                        Some(Ok(Message::Pong(_))) => {
                            self.last_pong_at_ms.store(epoch_ms(), Ordering::Relaxed);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let err = classify_close_code(code);
                            self.reject_all_pending(err).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => return,
                    }
                }
            }
        }
    }

    async fn handle_incoming_text(&self, text: &str) {
        let kind: FrameKind = match serde_json::from_str(text) {
            Ok(k) => k,
            Err(_) => return,
        };

        let is_event = kind.kind.as_deref() == Some("event");
        if is_event {
            if let Ok(event) = serde_json::from_str::<EventFrame>(text) {
                self.events.dispatch(&event).await;
            }
            return;
        }

        let Some(id) = kind.id else { return };
        let Some(tx) = self.pending.lock().await.remove(&id) else { return };

        let res: ResponseFrame = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(GatewayError::gateway_rpc_error(format!(
                    "malformed response: {e}"
                ))));
                return;
            }
        };

        if res.is_success() {
            let _ = tx.send(Ok(res.body()));
        } else if let Some(error) = &res.error {
            let gw_err = if error.code.is_auth_class() {
                GatewayError::Unauthorized
            } else if error.code.is_not_found() {
                GatewayError::NotFound
            } else {
                let details = error.data.clone().unwrap_or(Value::Null);
                GatewayError::gateway_rpc_error_with_details(error.message.clone(), details)
            };
            let _ = tx.send(Err(gw_err));
        } else {
            let _ = tx.send(Err(GatewayError::gateway_rpc_error("request rejected")));
        }
    }

    fn heartbeat_ticker(&self) -> Option<tokio::time::Interval> {
        if self.opts.heartbeat_interval.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval(self.opts.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            Some(interval)
        }
    }
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) -> bool {
    match interval {
        Some(i) => {
            i.tick().await;
            true
        }
        None => std::future::pending().await,
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriteHalf = futures_util::stream::SplitSink<WsStream, Message>;
type WsReadHalf = futures_util::stream::SplitStream<WsStream>;

fn classify_connect_error(e: &tokio_tungstenite::tungstenite::Error) -> GatewayError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            GatewayError::Unauthorized
        }
        other => GatewayError::gateway_connect_failed(other.to_string()),
    }
}

fn classify_connect_response(res: &ResponseFrame) -> Result<(), GatewayError> {
    if res.is_success() {
        return Ok(());
    }
    match &res.error {
        Some(error) if error.code.is_auth_class() => Err(GatewayError::Unauthorized),
        Some(error) => Err(GatewayError::gateway_connect_failed(error.message.clone())),
        None => Err(GatewayError::gateway_connect_failed("connect rejected")),
    }
}

fn classify_close_code(code: Option<u16>) -> GatewayError {
    match code {
        Some(4001) | Some(4003) => GatewayError::Unauthorized,
        _ => GatewayError::gateway_connect_failed("connection closed"),
    }
}

fn epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
