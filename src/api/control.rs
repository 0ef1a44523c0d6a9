//! Control-plane endpoints the chat client calls alongside completions.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use crate::chat_store::ChatContext;
use crate::error::ProxyError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
struct ConfirmRequest {
    #[serde(default)]
    request_id: Option<String>,
}

fn parse_confirm(body: &[u8]) -> Result<ConfirmRequest, ProxyError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ConfirmRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ProxyError::MalformedRequest(format!("Invalid confirmation body: {err}")))
}

/// `POST /v1/proxy/confirm`: the caller has received a reply.
pub fn confirm_handler(State(state): State<Arc<AppState>>, body: &Bytes) -> Response {
    let request = match parse_confirm(body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let request_id = request
        .request_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let confirmed = state.engine.confirm(request_id);

    Json(json!({
        "confirmed": confirmed.is_some(),
        "request_id": confirmed,
    }))
    .into_response()
}

/// `POST /v1/proxy/chat-context`: remember the chat the client is showing.
pub fn chat_context_handler(State(state): State<Arc<AppState>>, body: &Bytes) -> Response {
    let context: ChatContext = match serde_json::from_slice(body) {
        Ok(context) => context,
        Err(err) => {
            return ProxyError::MalformedRequest(format!("Invalid chat context: {err}"))
                .into_response();
        }
    };
    let destination = context.label();
    let resolvable = context.destination().is_some();
    state.sync_chat_context(context);

    Json(json!({
        "synced": true,
        "resolvable": resolvable,
        "destination": destination,
    }))
    .into_response()
}

/// `GET /v1/proxy/requests`: open request records, most recent first.
pub fn requests_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "requests": state.request_log.snapshot() })).into_response()
}
