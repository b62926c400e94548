// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process configuration for the gateway bridge.

use std::time::Duration;

/// Configuration for the gateway bridge proxy.
#[derive(Debug, Clone, clap::Parser)]
pub struct GatewayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "API_PORT")]
    pub port: u16,

    /// Upstream Gateway WebSocket endpoint (ws:// or wss://).
    #[arg(long, env = "GATEWAY_WS_URL")]
    pub gateway_ws_url: String,

    /// Origin header sent on WS upgrade. Empty means let the library default.
    #[arg(long, default_value = "", env = "GATEWAY_WS_ORIGIN")]
    pub gateway_ws_origin: String,

    /// Timeout for establishing a connection and completing the handshake.
    #[arg(long, default_value_t = 10_000, env = "GATEWAY_CONNECT_TIMEOUT_MS")]
    pub gateway_connect_timeout_ms: u64,

    /// Timeout waiting for a per-request RPC response.
    #[arg(long, default_value_t = 30_000, env = "GATEWAY_REQUEST_TIMEOUT_MS")]
    pub gateway_request_timeout_ms: u64,

    /// Interval between WS pings sent to keep a connection alive.
    #[arg(long, default_value_t = 20_000, env = "GATEWAY_HEARTBEAT_INTERVAL_MS")]
    pub gateway_heartbeat_interval_ms: u64,

    /// Disable TLS certificate verification for outbound WS connections.
    #[arg(long, default_value_t = true, env = "TLS_VERIFY")]
    pub tls_verify: bool,

    /// Enable the per-request SSE endpoint.
    #[arg(long, default_value_t = true, env = "STREAMING_ENABLED")]
    pub streaming_enabled: bool,

    /// Comma-separated list of allowed CORS origins. Empty = permissive.
    #[arg(long, default_value = "", env = "CORS_ORIGINS")]
    pub cors_origins: String,

    /// Client id sent in the handshake descriptor.
    #[arg(long, default_value = "openclaw-control-ui", env = "GATEWAY_CLIENT_ID")]
    pub gateway_client_id: String,

    /// Client instance id sent in the handshake descriptor.
    #[arg(long, env = "GATEWAY_CLIENT_INSTANCE_ID")]
    pub gateway_client_instance_id: Option<String>,

    /// Client version string sent in the handshake descriptor.
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"), env = "GATEWAY_CLIENT_VERSION")]
    pub gateway_client_version: String,
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.gateway_heartbeat_interval_ms)
    }

    /// Parsed CORS origin list; empty means "allow any origin".
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
