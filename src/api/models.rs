use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::transport::read_body;

const SYNTHETIC_MODEL_CREATED: i64 = 1_677_610_602;

fn synthetic_models(default_model: &str) -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": default_model,
            "object": "model",
            "created": SYNTHETIC_MODEL_CREATED,
            "owned_by": "reply-guard",
        }]
    })
}

/// `GET /v1/models` (and `/models`).
///
/// Without an upstream key a single-model list naming the configured
/// default model is returned. Otherwise the upstream listing is relayed with
/// its status, content type and body untouched.
pub async fn handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.upstream.has_api_key() {
        return (
            StatusCode::OK,
            Json(synthetic_models(&state.config.upstream.default_model)),
        )
            .into_response();
    }

    let upstream = match state.upstream.fetch_models().await {
        Ok(response) => response,
        Err(err) => return err.into_response(),
    };
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    match read_body(upstream).await {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            response
        }
        Err(err) => err.into_response(),
    }
}
