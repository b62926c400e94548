// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared by the RPC client, session manager, and HTTP surface.

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for the gateway bridge API.
///
/// Every error that crosses an internal boundary (RpcClient -> SessionManager
/// -> HTTP layer) is one of these variants. The HTTP layer classifies by
/// `code` exactly once, at the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum GatewayError {
    Unauthorized,
    GatewayConnectFailed { message: String },
    GatewayRpcError { message: String, details: Option<serde_json::Value> },
    BadRequest { message: String },
    NotFound,
    StreamingDisabled,
    InvalidToken,
    Internal { message: String },
}

impl GatewayError {
    pub fn gateway_connect_failed(message: impl Into<String>) -> Self {
        Self::GatewayConnectFailed { message: message.into() }
    }

    pub fn gateway_rpc_error(message: impl Into<String>) -> Self {
        Self::GatewayRpcError { message: message.into(), details: None }
    }

    pub fn gateway_rpc_error_with_details(
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::GatewayRpcError { message: message.into(), details: Some(details) }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::GatewayConnectFailed { .. } | Self::GatewayRpcError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::StreamingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The machine-readable wire code sent in the error envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::GatewayConnectFailed { .. } => "GATEWAY_CONNECT_FAILED",
            Self::GatewayRpcError { .. } => "GATEWAY_RPC_ERROR",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::StreamingDisabled => "STREAMING_DISABLED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized => "unauthorized".to_owned(),
            Self::InvalidToken => "invalid token".to_owned(),
            Self::GatewayConnectFailed { message } => message.clone(),
            Self::GatewayRpcError { message, .. } => message.clone(),
            Self::BadRequest { message } => message.clone(),
            Self::NotFound => "not found".to_owned(),
            Self::StreamingDisabled => "streaming is disabled".to_owned(),
            Self::Internal { message } => message.clone(),
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.as_str().to_owned(),
            message: self.message(),
            details: match self {
                Self::GatewayRpcError { details, .. } => details.clone(),
                _ => None,
            },
        }
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ApiResponse<()>>) {
        (self.http_status(), Json(ApiResponse::err(self.to_error_body())))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_str(), self.message())
    }
}

impl std::error::Error for GatewayError {}

/// Top-level `{ ok, data?, error? }` response envelope returned by every handler.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    pub fn err(error: ErrorBody) -> Self {
        Self { ok: false, data: None, error: Some(error) }
    }
}

/// Error body with machine-readable code, human-readable message, and
/// optional structured detail propagated from the Gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = self.to_http_response();
        (status, body).into_response()
    }
}
