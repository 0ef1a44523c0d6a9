use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::chat_store::ChatContext;
use crate::error::ProxyError;
use crate::observability::log_request_complete;
use crate::reconcile::{is_test_message, FinishedCapture};
use crate::request_log::{RequestRecord, RequestStatus};
use crate::state::{AppState, REQUEST_ID_HEADER};
use crate::stream::{extract_message_text, relay_with_capture};
use crate::transport::read_body;

/// Per-request facts gathered on arrival and carried to the point where the
/// capture is handed to the reconciliation engine.
struct Exchange {
    request_id: String,
    model: String,
    streaming: bool,
    is_test: bool,
    chat_context: Option<ChatContext>,
    generation_started: DateTime<Utc>,
    start: Instant,
}

impl Exchange {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// `POST /v1/chat/completions`.
///
/// The request body goes upstream unchanged. `"stream": true` selects the
/// relaying forwarder, anything else the buffered path. Every request gets a
/// record on arrival, including ones rejected before reaching upstream.
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut exchange = Exchange {
        request_id: state.request_id_for(&headers),
        model: state.config.upstream.default_model.clone(),
        streaming: false,
        is_test: false,
        chat_context: state.resolve_chat_context(&headers),
        generation_started: Utc::now(),
        start: Instant::now(),
    };

    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            open_record(&state, &exchange);
            let err = ProxyError::MalformedRequest(format!("Invalid JSON body: {err}"));
            return fail(&state, &exchange, err).await;
        }
    };
    if let Some(model) = request.get("model").and_then(Value::as_str) {
        exchange.model = model.to_string();
    }
    exchange.streaming = request.get("stream").and_then(Value::as_bool) == Some(true);
    exchange.is_test = is_test_message(&request);
    drop(request);

    open_record(&state, &exchange);
    if !state.upstream.has_api_key() {
        let err = ProxyError::Config("Upstream API key is not configured".to_string());
        return fail(&state, &exchange, err).await;
    }
    tracing::debug!(
        request_id = %exchange.request_id,
        model = %exchange.model,
        streaming = exchange.streaming,
        is_test = exchange.is_test,
        "forwarding completion"
    );

    let upstream = match state.upstream.send_completion(body).await {
        Ok(response) => response,
        Err(err) => return fail(&state, &exchange, err).await,
    };

    if exchange.streaming {
        stream_response(state, exchange, upstream)
    } else {
        buffered_response(&state, exchange, upstream).await
    }
}

fn open_record(state: &AppState, exchange: &Exchange) {
    state.request_log.open(RequestRecord::pending(
        exchange.request_id.clone(),
        exchange.model.clone(),
        exchange.chat_context.as_ref().and_then(ChatContext::label),
        exchange.streaming,
        exchange.is_test,
    ));
}

async fn buffered_response(state: &AppState, exchange: Exchange, upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let payload = match read_body(upstream).await {
        Ok(payload) => payload,
        Err(err) => return fail(state, &exchange, err).await,
    };
    let text = match extract_message_text(&payload) {
        Ok(text) => text,
        Err(err) => {
            let err = ProxyError::Parse(format!("Upstream returned invalid JSON: {err}"));
            return fail(state, &exchange, err).await;
        }
    };

    let request_id = exchange.request_id.clone();
    settle(state, exchange, text, None, Utc::now()).await;

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    with_request_id(response, &request_id)
}

fn stream_response(state: Arc<AppState>, exchange: Exchange, upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
    let request_id = exchange.request_id.clone();

    let body = relay_with_capture(upstream.bytes_stream(), move |capture| async move {
        if capture.caller_disconnected {
            tracing::info!(
                request_id = %exchange.request_id,
                captured_len = capture.text.len(),
                "caller left before the stream ended"
            );
        }
        settle(&state, exchange, capture.text, capture.error, capture.finished_at).await;
    });

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    with_request_id(response, &request_id)
}

/// Hand the finished capture to the engine, then close the request record.
async fn settle(
    state: &AppState,
    exchange: Exchange,
    text: String,
    error: Option<String>,
    generation_finished: DateTime<Utc>,
) {
    let has_error = error.is_some();
    let elapsed_ms = exchange.elapsed_ms();
    state.engine.finish_capture(FinishedCapture {
        request_id: exchange.request_id.clone(),
        model: exchange.model.clone(),
        text,
        has_error,
        is_test: exchange.is_test,
        chat_context: exchange.chat_context,
        generation_started: exchange.generation_started,
        generation_finished,
    });

    let status = if has_error {
        RequestStatus::Error
    } else {
        RequestStatus::Success
    };
    state
        .request_log
        .close(&exchange.request_id, status, elapsed_ms, error)
        .await;
    log_request_complete(&exchange.request_id, &exchange.model, exchange.streaming, exchange.start);
}

/// Close the record for a request that failed before any capture existed.
async fn fail(state: &AppState, exchange: &Exchange, err: ProxyError) -> Response {
    tracing::warn!(
        request_id = %exchange.request_id,
        status = err.status().as_u16(),
        error = %err,
        "completion failed"
    );
    state
        .request_log
        .close(
            &exchange.request_id,
            RequestStatus::Error,
            exchange.elapsed_ms(),
            Some(err.to_string()),
        )
        .await;
    with_request_id(err.into_response(), &exchange.request_id)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
