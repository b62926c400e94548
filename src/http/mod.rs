// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + SSE transport for the gateway bridge.
//!
//! Thin by design: auth is a per-handler extractor (`auth::BearerToken`)
//! rather than a blanket middleware layer, since every route but `/health`
//! and `/api/auth/verify` needs the token anyway to pick a pooled
//! connection. `GatewayError` implements `IntoResponse` directly, so
//! handlers return it via `?` and the envelope in `error.rs` is applied
//! exactly once, at the edge.

pub mod auth;
pub mod handlers;
pub mod sse;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::forwarder::EventForwarder;
use crate::pool::ConnectionPool;
use crate::session::SessionManager;

/// Shared application state handed to every handler via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: Arc<ConnectionPool>,
    pub sessions: Arc<SessionManager>,
    pub forwarder: Arc<EventForwarder>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, pool: Arc<ConnectionPool>) -> Self {
        let sessions = Arc::new(SessionManager::new(Arc::clone(&pool)));
        let forwarder = EventForwarder::new(Arc::clone(&pool));
        Self { config, pool, sessions, forwarder }
    }
}

/// Build the axum `Router` exposing the public HTTP API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/auth/verify", post(handlers::verify))
        .route("/api/sessions", get(handlers::list_sessions).post(handlers::create_session))
        .route("/api/sessions/{key}/messages", get(handlers::list_messages).post(handlers::send_message))
        .route("/api/sessions/{key}/messages/stream", post(sse::send_message_stream))
        .route("/api/sessions/{key}", patch(handlers::patch_session).delete(handlers::close_session))
        .route("/api/events", get(sse::events))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the CORS layer from `GatewayConfig::cors_origin_list`. An empty
/// list means permissive (any origin); otherwise only the configured
/// origins are allowed, across the methods this API actually uses.
fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins = config.cors_origin_list();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> =
            origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE])
}
