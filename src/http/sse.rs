// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two SSE endpoints: per-request streaming send, and the persistent
//! push-event channel.

use std::convert::Infallible;

use axum::extract::{Multipart, Path, State};
use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::error::GatewayError;
use crate::session::stream::{send_stream, StreamEvent};

use super::auth::BearerToken;
use super::handlers::parse_send_multipart;
use super::AppState;

/// `POST /api/sessions/:key/messages/stream`
pub async fn send_message_stream(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(key): Path<String>,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    if !state.config.streaming_enabled {
        return Err(GatewayError::StreamingDisabled);
    }

    let (text, images) = parse_send_multipart(multipart).await?;
    let inner = send_stream(&state.sessions, &token, &key, &text, images).await?;

    Ok(Sse::new(wrap_send_stream(inner)))
}

fn wrap_send_stream(
    inner: impl Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let status = stream::once(async {
        Ok(Event::default().data(json!({ "type": "status", "status": "sending" }).to_string()))
    });
    status.chain(inner.map(|item| Ok(to_sse_event(item))))
}

fn to_sse_event(item: Result<StreamEvent, GatewayError>) -> Event {
    match item {
        Ok(StreamEvent::Chunk(text)) => {
            Event::default().data(json!({ "type": "chunk", "text": text }).to_string())
        }
        Ok(StreamEvent::Done(_)) => {
            Event::default().data(json!({ "type": "done", "accepted": true }).to_string())
        }
        Err(e) => Event::default()
            .data(json!({ "type": "error", "code": e.as_str(), "message": e.message() }).to_string()),
    }
}

/// `GET /api/events` — the persistent push channel. Stays open until the
/// browser disconnects; the underlying [`ForwarderSubscription`] tears down
/// the Gateway subscription on drop once it's the last one for the token.
///
/// [`ForwarderSubscription`]: crate::forwarder::ForwarderSubscription
pub async fn events(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.forwarder.subscribe(&token).await;

    let stream = stream::unfold(subscription, |mut sub| async move {
        sub.recv().await.map(|event| (event, sub))
    });

    Sse::new(stream.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
        Ok(Event::default().data(data))
    }))
}
