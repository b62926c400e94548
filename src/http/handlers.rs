// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON request handlers for the public API.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiResponse, GatewayError};
use crate::session::ImageAttachment;

use super::auth::BearerToken;
use super::AppState;

const MAX_IMAGES: usize = 10;
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchSessionRequest {
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
}

/// `POST /api/auth/verify` — validates a token against the Gateway without
/// exposing it via the bearer header (the browser doesn't have a session
/// yet).
pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    match state.pool.verify_token(&req.token).await? {
        true => Ok(Json(ApiResponse::ok(json!({ "verified": true })))),
        false => Err(GatewayError::InvalidToken),
    }
}

/// `GET /api/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, GatewayError> {
    let sessions = state.sessions.list(&token).await?;
    Ok(Json(ApiResponse::ok(sessions)))
}

/// `POST /api/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let session = state.sessions.create(&token, req.title).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(session))))
}

/// `GET /api/sessions/:key/messages`
pub async fn list_messages(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let messages = state.sessions.history(&token, &key).await?;
    Ok(Json(ApiResponse::ok(messages)))
}

/// `POST /api/sessions/:key/messages` — blocks until `chat.send` returns.
pub async fn send_message(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(key): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, GatewayError> {
    let (text, images) = parse_send_multipart(multipart).await?;
    state.sessions.send(&token, &key, &text, images).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(json!({ "accepted": true })))))
}

/// `PATCH /api/sessions/:key` — accepts either field alone or both.
pub async fn patch_session(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(key): Path<String>,
    Json(req): Json<PatchSessionRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let mut merged = json!({ "sessionKey": key });

    if let Some(title) = &req.title {
        state.sessions.rename(&token, &key, title).await?;
        merged["title"] = json!(title);
    }
    if let Some(archived) = req.archived {
        if archived {
            state.sessions.archive(&token, &key).await;
        } else {
            state.sessions.unarchive(&token, &key).await;
        }
        merged["archived"] = json!(archived);
    }

    Ok(Json(ApiResponse::ok(merged)))
}

/// `DELETE /api/sessions/:key`
pub async fn close_session(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    state.sessions.close(&token, &key).await?;
    Ok(Json(ApiResponse::ok(json!({ "closed": true, "sessionKey": key }))))
}

/// `GET /health` — unauthenticated.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "gateway-bridge",
        "gateway": state.config.gateway_ws_url,
        "timestamp": crate::session::now_iso(),
    }))
}

/// Parse the `text` + `images[]` multipart body shared by both message
/// endpoints, enforcing the upload limits.
pub(crate) async fn parse_send_multipart(
    mut multipart: Multipart,
) -> Result<(String, Vec<ImageAttachment>), GatewayError> {
    let mut text = String::new();
    let mut images = Vec::new();

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| GatewayError::bad_request(format!("malformed multipart body: {e}")))?;
        let Some(field) = field else { break };

        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "text" => {
                text = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::bad_request(format!("bad text field: {e}")))?;
            }
            "images" | "images[]" => {
                if images.len() >= MAX_IMAGES {
                    return Err(GatewayError::bad_request(format!(
                        "at most {MAX_IMAGES} images are allowed per message"
                    )));
                }
                let file_name = field.file_name().unwrap_or("upload").to_owned();
                let mime_type = field.content_type().unwrap_or("application/octet-stream").to_owned();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::bad_request(format!("bad image field: {e}")))?;
                if bytes.len() > MAX_IMAGE_BYTES {
                    return Err(GatewayError::bad_request(format!(
                        "image {file_name} exceeds the {MAX_IMAGE_BYTES}-byte limit"
                    )));
                }
                images.push(ImageAttachment {
                    name: file_name,
                    mime_type,
                    bytes: BASE64.encode(&bytes),
                });
            }
            _ => {}
        }
    }

    Ok((text, images))
}
