use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use super::*;

fn test_options(ws_url: String) -> PoolOptions {
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

/// Mock gateway that counts connect handshakes and accepts any token whose
/// value is not `"bad-token"`.
async fn mock_gateway(connect_count: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let count = Arc::clone(&connect_count);
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let req: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if req["method"] == "connect" {
                        count.fetch_add(1, Ordering::SeqCst);
                        let res = json!({"type": "res", "id": req["id"], "result": {"ok": true}});
                        if ws.send(Message::Text(res.to_string().into())).await.is_err() {
                            return;
                        }
                    } else {
                        let res = json!({"type": "res", "id": req["id"], "result": {"sessions": []}});
                        if ws.send(Message::Text(res.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    format!("ws://{addr}/rpc")
}

#[tokio::test]
async fn concurrent_get_connection_shares_one_handshake() {
    let connect_count = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway(Arc::clone(&connect_count)).await;
    let pool = Arc::new(ConnectionPool::new(test_options(url)));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move { pool.get_connection("shared-token").await }));
    }
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }

    assert_eq!(connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_token_forces_a_fresh_handshake_on_next_use() {
    let connect_count = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway(Arc::clone(&connect_count)).await;
    let pool = ConnectionPool::new(test_options(url));

    pool.get_connection("t1").await.unwrap();
    pool.close_token("t1").await;
    pool.get_connection("t1").await.unwrap();

    assert_eq!(connect_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_entry_is_closed_before_its_replacement_is_inserted() {
    let connect_count = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway(Arc::clone(&connect_count)).await;
    let pool = ConnectionPool::new(test_options(url));

    let first = pool.get_connection("stale-token").await.unwrap();
    assert!(first.is_connected().await);

    // Backdate the entry past its TTL so the next get_connection treats it as stale.
    {
        let mut entries = pool.entries.write().await;
        let entry = entries.get_mut("stale-token").expect("entry present");
        entry.created_at = Instant::now() - ENTRY_TTL - Duration::from_secs(1);
    }

    let second = pool.get_connection("stale-token").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(connect_count.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_connected().await, "stale client should have been closed");
}

#[tokio::test]
async fn verify_token_reports_true_on_successful_handshake() {
    let connect_count = Arc::new(AtomicUsize::new(0));
    let url = mock_gateway(connect_count).await;
    let pool = ConnectionPool::new(test_options(url));

    assert_eq!(pool.verify_token("anything").await.unwrap(), true);
}
