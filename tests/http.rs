// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end HTTP surface tests against a mock Gateway. Uses
//! `axum_test::TestServer` for the browser-facing side and a real
//! `tokio_tungstenite`-speaking WS server on `127.0.0.1:0` standing in for
//! the upstream Gateway, so both halves of the bridge run for real.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use gateway_bridge::config::GatewayConfig;
use gateway_bridge::http::{build_router, AppState};
use gateway_bridge::pool::{ConnectionPool, PoolOptions};

fn test_config(ws_url: String) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        gateway_ws_url: ws_url,
        gateway_ws_origin: String::new(),
        gateway_connect_timeout_ms: 2_000,
        gateway_request_timeout_ms: 2_000,
        gateway_heartbeat_interval_ms: 0,
        tls_verify: true,
        streaming_enabled: true,
        cors_origins: String::new(),
        gateway_client_id: "openclaw-control-ui".to_owned(),
        gateway_client_instance_id: Some("test-instance".to_owned()),
        gateway_client_version: "0.0.0-test".to_owned(),
    }
}

fn test_server(config: GatewayConfig) -> TestServer {
    let config = Arc::new(config);
    let pool = Arc::new(ConnectionPool::new(PoolOptions::from_config(&config)));
    let state = AppState::new(config, pool);
    TestServer::new(build_router(state)).expect("create test server")
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

/// Accepts every connection, answers `connect` with `ok: true`, and answers
/// any other request with the fixed `result` given.
async fn mock_gateway_ok(connects: Arc<AtomicUsize>, result: serde_json::Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            connects.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                loop {
                    let req = recv(&mut ws).await;
                    let body = if req["method"] == "connect" {
                        json!({"ok": true})
                    } else {
                        result.clone()
                    };
                    let res = json!({"type": "res", "id": req["id"], "result": body});
                    if ws.send(Message::Text(res.to_string().into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    format!("ws://{addr}/rpc")
}

/// Rejects the WS upgrade with HTTP 401, as the Gateway would for an invalid
/// token.
async fn mock_gateway_rejecting() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            use tokio::io::AsyncWriteExt;
            let _ = stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
    });
    format!("ws://{addr}/rpc")
}

#[tokio::test]
async fn fresh_login_success() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway_ok(Arc::clone(&connects), json!({})).await;
    let server = test_server(test_config(url));

    let resp = server.post("/api/auth/verify").json(&json!({"token": "good"})).await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["verified"], true);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_token_reports_invalid_token_code() {
    let url = mock_gateway_rejecting().await;
    let server = test_server(test_config(url));

    let resp = server.post("/api/auth/verify").json(&json!({"token": "bad"})).await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn concurrent_session_lists_share_one_connect_frame() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway_ok(Arc::clone(&connects), json!({"sessions": []})).await;
    let server = Arc::new(test_server(test_config(url)));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let server = Arc::clone(&server);
        handles.push(tokio::spawn(async move {
            server
                .get("/api/sessions")
                .add_header(
                    axum::http::header::AUTHORIZATION,
                    axum::http::HeaderValue::from_static("Bearer shared-token"),
                )
                .await
        }));
    }
    for h in handles {
        let resp = h.await.unwrap();
        resp.assert_status(StatusCode::OK);
        let body: serde_json::Value = resp.json();
        assert_eq!(body["ok"], true);
    }

    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway_ok(connects, json!({"sessions": []})).await;
    let server = test_server(test_config(url));

    let resp = server.get("/api/sessions").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn streaming_happy_path_emits_status_chunks_then_done() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let connect_req = recv(&mut ws).await;
        let res = json!({"type": "res", "id": connect_req["id"], "result": {"ok": true}});
        ws.send(Message::Text(res.to_string().into())).await.unwrap();

        let send_req = recv(&mut ws).await;
        assert_eq!(send_req["method"], "chat.send");

        for delta in ["Hel", "lo"] {
            let event = json!({
                "type": "event",
                "event": "agent",
                "payload": {"sessionKey": "s1", "stream": "assistant", "data": {"delta": delta}}
            });
            ws.send(Message::Text(event.to_string().into())).await.unwrap();
        }

        let final_event = json!({
            "type": "event",
            "event": "chat",
            "payload": {"sessionKey": "s1", "state": "final", "message": {"role": "assistant", "content": "Hello"}}
        });
        ws.send(Message::Text(final_event.to_string().into())).await.unwrap();

        let send_res = json!({"type": "res", "id": send_req["id"], "result": {"accepted": true}});
        ws.send(Message::Text(send_res.to_string().into())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
    });

    let url = format!("ws://{addr}/rpc");
    let server = test_server(test_config(url));

    let resp = server
        .post("/api/sessions/s1/messages/stream")
        .add_header(
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderValue::from_static("Bearer tok"),
        )
        .multipart(axum_test::multipart::MultipartForm::new().add_text("text", "Hi"))
        .await;

    resp.assert_status(StatusCode::OK);
    let body = resp.text();
    let events: Vec<&str> = body.lines().filter(|l| l.starts_with("data:")).collect();
    assert_eq!(events.len(), 4);
    assert!(events[0].contains(r#""status":"sending""#));
    assert!(events[1].contains(r#""chunk""#) && events[1].contains("Hel"));
    assert!(events[2].contains(r#""chunk""#) && events[2].contains("lo"));
    assert!(events[3].contains(r#""done""#));
}

#[tokio::test]
async fn streaming_disabled_returns_503() {
    let connects = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway_ok(connects, json!({})).await;
    let mut config = test_config(url);
    config.streaming_enabled = false;
    let server = test_server(config);

    let resp = server
        .post("/api/sessions/s1/messages/stream")
        .add_header(
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderValue::from_static("Bearer tok"),
        )
        .multipart(axum_test::multipart::MultipartForm::new().add_text("text", "Hi"))
        .await;

    resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "STREAMING_DISABLED");
}
