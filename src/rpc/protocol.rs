// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire shapes for the Gateway's framed WebSocket RPC protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed protocol version this client speaks. Downgrading requires bumping this constant.
pub const PROTOCOL_VERSION: u32 = 3;

/// Outbound request frame: `{ type: "req", id, method, params? }`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { kind: "req", id: id.into(), method: method.into(), params }
    }
}

/// Inbound response frame: `{ type: "res", id, result?, payload?, ok?, error? }`.
///
/// Fields are intentionally loose (`Option`s rather than required) because the
/// Gateway's response shape has some variance between `result` and `payload`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

impl ResponseFrame {
    /// `error == null AND ok != false`.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.ok != Some(false)
    }

    /// `result` if present else `payload`.
    pub fn body(&self) -> Value {
        self.result.clone().or_else(|| self.payload.clone()).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// The Gateway encodes error codes as either a string or an integer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Str(String),
    Num(i64),
}

impl ErrorCode {
    /// Whether this code belongs to the auth-class set that maps to an
    /// unauthorized/forbidden response.
    pub fn is_auth_class(&self) -> bool {
        match self {
            Self::Str(s) => matches!(s.as_str(), "UNAUTHORIZED" | "401" | "403" | "FORBIDDEN"),
            Self::Num(n) => matches!(n, 401 | 403),
        }
    }

    /// Whether this code reports that the target resource doesn't exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Str(s) => matches!(s.as_str(), "NOT_FOUND" | "404"),
            Self::Num(n) => matches!(n, 404),
        }
    }
}

/// Inbound event frame: `{ type: "event", event, payload, seq?, ... }`, with legacy
/// `name`/`data` aliases accepted when `event`/`payload` are absent.
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub seq: Option<i64>,
}

impl EventFrame {
    pub fn event_name(&self) -> String {
        self.event.clone().or_else(|| self.name.clone()).unwrap_or_default()
    }

    pub fn event_payload(&self) -> Value {
        self.payload.clone().or_else(|| self.data.clone()).unwrap_or(Value::Null)
    }
}

/// Discriminates an inbound frame without fully deserializing its body, mirroring
/// the route-info peek used to route responses vs. streaming events.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FrameKind {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Client descriptor sent as part of the connect handshake params.
#[derive(Debug, Clone, Serialize)]
pub struct ClientDescriptor {
    pub id: String,
    pub version: String,
    pub platform: &'static str,
    pub mode: &'static str,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

/// Params sent with the mandatory connect request, the first frame on any fresh WS.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientDescriptor,
    pub role: &'static str,
    pub scopes: Vec<&'static str>,
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectAuth {
    pub token: String,
}

/// Fixed operator scope list requested at handshake time.
pub const OPERATOR_SCOPES: &[&str] =
    &["operator:read", "operator:admin", "operator:approvals", "operator:pairing"];

impl ConnectParams {
    pub fn new(
        token: String,
        client_id: String,
        client_version: String,
        instance_id: String,
    ) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientDescriptor {
                id: client_id,
                version: client_version,
                platform: "web",
                mode: "operator",
                instance_id,
            },
            role: "operator",
            scopes: OPERATOR_SCOPES.to_vec(),
            auth: ConnectAuth { token },
        }
    }
}
