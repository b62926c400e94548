// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async generator bridging one `chat.send` RPC with subscribed push events
//! into a chunked output stream, used by the per-request SSE endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::error::GatewayError;
use crate::forwarder::{translate, PushEvent};
use crate::rpc::RpcClient;

use super::{send_params, ImageAttachment, SessionManager};

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Done(Value),
}

/// Run a `chat.send` against `key`, yielding [`StreamEvent`]s as the Gateway
/// pushes assistant chunks, terminating on the first `Done`.
///
/// The returned stream is lazy, finite, and non-restartable. Its event
/// subscription is torn down on every exit path, including the consumer
/// dropping the stream without draining it.
pub async fn send_stream(
    manager: &SessionManager,
    token: &str,
    key: &str,
    text: &str,
    images: Vec<ImageAttachment>,
) -> Result<impl Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static, GatewayError> {
    let client = manager.pool().get_connection(token).await?;
    let (tx, rx) = mpsc::channel::<Result<StreamEvent, GatewayError>>(32);

    let done = Arc::new(AtomicBool::new(false));
    let session_key = key.to_owned();
    let chunk_tx = tx.clone();
    let done_for_filter = Arc::clone(&done);

    let subscription = client
        .subscribe_event("*", move |frame| {
            let Some(event) = translate(frame) else { return };
            match event {
                PushEvent::Chunk { session_key: sk, text } if sk == session_key => {
                    let _ = chunk_tx.try_send(Ok(StreamEvent::Chunk(text)));
                }
                PushEvent::MessageFinal { session_key: sk, message } if sk == session_key => {
                    if !done_for_filter.swap(true, Ordering::SeqCst) {
                        let _ = chunk_tx.try_send(Ok(StreamEvent::Done(message)));
                    }
                }
                // AgentStart/AgentEnd and other sessions' events are not part
                // of this stream's contract.
                _ => {}
            }
        })
        .await;

    let params = send_params(key, text, &images);

    let rpc_client = Arc::clone(&client);
    let rpc_tx = tx;
    let rpc_done = done;
    tokio::spawn(async move {
        let result = rpc_client.request("chat.send", Some(params)).await;
        match result {
            Ok(value) => {
                if !rpc_done.swap(true, Ordering::SeqCst) {
                    let _ = rpc_tx.try_send(Ok(StreamEvent::Done(value)));
                }
            }
            Err(e) => {
                let _ = rpc_tx.try_send(Err(e));
            }
        }
        rpc_client.unsubscribe(subscription).await;
    });

    Ok(terminate_after_done(ReceiverStream::new(rx)))
}

/// Stop the stream the moment a `Done` (or an error) has been yielded, even
/// if more frames happen to queue up behind it.
fn terminate_after_done(
    inner: impl Stream<Item = Result<StreamEvent, GatewayError>> + Send,
) -> impl Stream<Item = Result<StreamEvent, GatewayError>> + Send {
    async_stream_take_until_done(inner)
}

fn async_stream_take_until_done(
    inner: impl Stream<Item = Result<StreamEvent, GatewayError>> + Send,
) -> impl Stream<Item = Result<StreamEvent, GatewayError>> + Send {
    use futures_util::StreamExt as _;
    let mut finished = false;
    inner.take_while(move |item| {
        if finished {
            return false;
        }
        if matches!(item, Ok(StreamEvent::Done(_)) | Err(_)) {
            finished = true;
        }
        true
    })
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
