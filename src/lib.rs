// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gateway bridge: a BFF that multiplexes many browser HTTP/SSE sessions
//! onto a pool of long-lived WebSocket RPC connections to an upstream chat
//! platform (the "Gateway").

pub mod config;
pub mod error;
pub mod forwarder;
pub mod http;
pub mod pool;
pub mod rpc;
pub mod session;
pub mod tls;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::GatewayConfig;
use crate::http::{build_router, AppState};
use crate::pool::{ConnectionPool, PoolOptions};

/// Run the bridge until the listener is shut down.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    tls::install_crypto_provider();

    let addr = format!("{}:{}", config.host, config.port);
    let config = Arc::new(config);

    let pool = Arc::new(ConnectionPool::new(PoolOptions::from_config(&config)));
    let state = AppState::new(Arc::clone(&config), pool);

    tracing::info!(
        %addr,
        gateway = %config.gateway_ws_url,
        streaming_enabled = config.streaming_enabled,
        "gateway-bridge listening"
    );

    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
