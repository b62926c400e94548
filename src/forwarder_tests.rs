use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use super::*;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::rpc::protocol::EventFrame;

fn test_pool_options(ws_url: String) -> PoolOptions {
    PoolOptions {
        ws_url,
        origin: None,
        client_id: "openclaw-control-ui".to_owned(),
        client_version: "0.0.0-test".to_owned(),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(0),
        tls_verify: true,
        instance_id: None,
    }
}

async fn recv(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }
}

/// Accepts one connection, completes the handshake, then emits one chunk and
/// one final event for `session`, staying open until `hold` elapses.
async fn mock_forwarder_gateway(connects: Arc<AtomicUsize>, session: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            connects.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let connect_req = recv(&mut ws).await;
                let res = json!({"type": "res", "id": connect_req["id"], "result": {"ok": true}});
                if ws.send(Message::Text(res.to_string().into())).await.is_err() {
                    return;
                }

                let chunk = json!({
                    "type": "event",
                    "event": "agent",
                    "payload": {"sessionKey": session, "stream": "assistant", "data": {"delta": "hi"}}
                });
                let _ = ws.send(Message::Text(chunk.to_string().into())).await;

                let finalev = json!({
                    "type": "event",
                    "event": "chat",
                    "payload": {"sessionKey": session, "state": "final", "message": {"role": "assistant", "content": "done"}}
                });
                let _ = ws.send(Message::Text(finalev.to_string().into())).await;

                tokio::time::sleep(Duration::from_secs(5)).await;
            });
        }
    });
    format!("ws://{addr}/rpc")
}

fn event_frame(name: &str, payload: serde_json::Value) -> EventFrame {
    serde_json::from_value(json!({"type": "event", "event": name, "payload": payload})).unwrap()
}

#[test]
fn translate_maps_assistant_delta_to_chunk() {
    let frame = event_frame(
        "agent",
        json!({"sessionKey": "s1", "stream": "assistant", "data": {"delta": "hi"}}),
    );
    let event = translate(&frame).unwrap();
    assert!(matches!(event, PushEvent::Chunk { session_key, text } if session_key == "s1" && text == "hi"));
}

#[test]
fn translate_maps_lifecycle_phases_to_start_and_end() {
    let start = event_frame(
        "agent",
        json!({"sessionKey": "s1", "stream": "lifecycle", "data": {"phase": "start", "runId": "r1"}}),
    );
    let end = event_frame(
        "agent",
        json!({"sessionKey": "s1", "stream": "lifecycle", "data": {"phase": "end", "runId": "r1"}}),
    );
    assert!(matches!(translate(&start).unwrap(), PushEvent::AgentStart { .. }));
    assert!(matches!(translate(&end).unwrap(), PushEvent::AgentEnd { .. }));
}

#[test]
fn translate_maps_final_chat_state_to_message_final() {
    let frame = event_frame(
        "chat",
        json!({"sessionKey": "s1", "state": "final", "message": {"role": "assistant", "content": "ok"}}),
    );
    assert!(matches!(translate(&frame).unwrap(), PushEvent::MessageFinal { .. }));
}

#[test]
fn translate_drops_unrecognized_frames() {
    let frame = event_frame("presence", json!({"sessionKey": "s1", "status": "typing"}));
    assert!(translate(&frame).is_none());

    let non_final = event_frame("chat", json!({"sessionKey": "s1", "state": "pending"}));
    assert!(translate(&non_final).is_none());
}

#[tokio::test]
async fn first_subscriber_attaches_and_receives_translated_events() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_forwarder_gateway(Arc::clone(&connects), "s1").await;
    let pool = Arc::new(ConnectionPool::new(test_pool_options(url)));
    let forwarder = EventForwarder::new(pool);

    let mut sub = forwarder.subscribe("tok").await;
    let first = sub.recv().await.unwrap();
    assert!(matches!(first, PushEvent::Chunk { .. }));
    let second = sub.recv().await.unwrap();
    assert!(matches!(second, PushEvent::MessageFinal { .. }));
}

#[tokio::test]
async fn second_subscriber_for_same_token_reuses_the_connection() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_forwarder_gateway(Arc::clone(&connects), "s1").await;
    let pool = Arc::new(ConnectionPool::new(test_pool_options(url)));
    let forwarder = EventForwarder::new(pool);

    let _a = forwarder.subscribe("tok").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _b = forwarder.subscribe("tok").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

/// Accepts connections in sequence: the first sends one chunk for `session`
/// then closes immediately (simulating the Gateway dropping the socket); the
/// second sends a distinct chunk and stays open so the test can observe it.
async fn mock_gateway_drops_then_reconnects(connects: Arc<AtomicUsize>, session: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let n = connects.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let connect_req = recv(&mut ws).await;
                let res = json!({"type": "res", "id": connect_req["id"], "result": {"ok": true}});
                if ws.send(Message::Text(res.to_string().into())).await.is_err() {
                    return;
                }

                let delta = if n == 0 { "before-drop" } else { "after-reconnect" };
                let chunk = json!({
                    "type": "event",
                    "event": "agent",
                    "payload": {"sessionKey": session, "stream": "assistant", "data": {"delta": delta}}
                });
                let _ = ws.send(Message::Text(chunk.to_string().into())).await;

                if n == 0 {
                    let _ = SinkExt::close(&mut ws).await;
                } else {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }
    });
    format!("ws://{addr}/rpc")
}

#[tokio::test]
async fn health_loop_reattaches_after_gateway_drops_mid_subscription() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway_drops_then_reconnects(Arc::clone(&connects), "s1").await;
    let pool = Arc::new(ConnectionPool::new(test_pool_options(url)));
    let forwarder = EventForwarder::new(pool);

    let mut sub = forwarder.subscribe("tok").await;
    let first = sub.recv().await.unwrap();
    assert!(matches!(&first, PushEvent::Chunk { text, .. } if text == "before-drop"));

    // The Gateway connection is closed right after sending the first chunk.
    // The health-check loop (HEALTH_CHECK_INTERVAL) notices within one tick
    // and re-attaches without the subscriber ever reconnecting itself.
    let second = tokio::time::timeout(Duration::from_secs(8), sub.recv())
        .await
        .expect("forwarder should reattach and deliver the next event")
        .unwrap();
    assert!(matches!(&second, PushEvent::Chunk { text, .. } if text == "after-reconnect"));
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn last_subscriber_dropping_tears_down_the_entry() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_forwarder_gateway(Arc::clone(&connects), "s1").await;
    let pool = Arc::new(ConnectionPool::new(test_pool_options(url)));
    let forwarder = EventForwarder::new(pool);

    {
        let _sub = forwarder.subscribe("tok").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // subscription dropped here; teardown happens on a spawned task.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(forwarder.entries.read().await.get("tok").is_none());
}
