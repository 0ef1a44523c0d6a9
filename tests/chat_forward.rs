mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;

use common::{
    assert_status, completion_request, harness, read_body, read_json, spawn_upstream, wait_until,
    UPSTREAM_KEY,
};

const WINDOW_MS: u64 = 150;
const SETTLE: Duration = Duration::from_millis(2000);

const FRAMES: [&[u8]; 4] = [
    b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
    b"data: {\"choices\":[{\"delta\":{\"con",
    b"tent\":\" there\"}}]}\n\n",
    b"data: [DONE]\n\n",
];

fn buffered_upstream(content: &'static str) -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap| async move {
            let expected = format!("Bearer {UPSTREAM_KEY}");
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            Json(json!({
                "id": "chatcmpl_1",
                "object": "chat.completion",
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": content },
                    "finish_reason": "stop"
                }]
            }))
            .into_response()
        }),
    )
}

fn streaming_upstream() -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let frames: Vec<Result<Bytes, std::io::Error>> = FRAMES
                .into_iter()
                .map(|frame| Ok(Bytes::from_static(frame)))
                .collect();
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(futures_util::stream::iter(frames)))
                .expect("stream response")
        }),
    )
}

fn chat_body(content: &str, stream: bool) -> serde_json::Value {
    json!({
        "model": "gpt-4o-mini",
        "messages": [
            { "role": "system", "content": "You are Seraphina." },
            { "role": "user", "content": content }
        ],
        "stream": stream
    })
}

#[tokio::test]
async fn test_buffered_reply_is_saved_once_window_expires() {
    let (base_url, server) = spawn_upstream(buffered_upstream("Hello world")).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let response = h.send(completion_request(&chat_body("hello", false))).await;
    assert_status(&response, StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("request id header")
        .to_string();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let payload = read_json(response).await;
    assert_eq!(payload["choices"][0]["message"]["content"], "Hello world");
    assert!(h.state.engine.is_pending(&request_id));

    assert!(wait_until(SETTLE, || h.store.appends.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 2)).await;
    assert_eq!(h.saved_texts(), vec!["Hello world".to_string()]);

    let append = h.store.appends.lock()[0].clone();
    assert_eq!(append.message.request_id, request_id);
    assert_eq!(append.message.name, "Seraphina");
    assert_eq!(append.message.model, "gpt-4o-mini");
    assert_eq!(append.context.chat_file.as_deref(), Some("Seraphina - 2024-5-1"));
    assert_eq!(append.directories.chats, h.dir.path().join("data").join("chats"));
    assert!(!h.state.engine.is_pending(&request_id));

    let records = h.logged_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], request_id.as_str());
    assert_eq!(records[0]["status"], "success");
    assert_eq!(records[0]["streaming"], false);
    assert_eq!(records[0]["character"], "Seraphina");

    server.abort();
}

#[tokio::test]
async fn test_streaming_relay_is_byte_identical_and_captures_text() {
    let (base_url, server) = spawn_upstream(streaming_upstream()).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let response = h.send(completion_request(&chat_body("tell me", true))).await;
    assert_status(&response, StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        headers.get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );
    assert_eq!(
        headers.get("x-accel-buffering").and_then(|v| v.to_str().ok()),
        Some("no")
    );
    assert!(headers.contains_key("x-request-id"));

    let relayed = read_body(response).await;
    let expected: Vec<u8> = FRAMES.concat();
    assert_eq!(relayed.as_ref(), expected.as_slice());

    assert!(wait_until(SETTLE, || h.store.appends.lock().len() == 1).await);
    assert_eq!(h.saved_texts(), vec!["Hi there".to_string()]);
    assert!(wait_until(SETTLE, || h.logged_records().len() == 1).await);
    assert_eq!(h.logged_records()[0]["streaming"], true);

    server.abort();
}

#[tokio::test]
async fn test_confirmation_before_deadline_cancels_save() {
    let (base_url, server) = spawn_upstream(buffered_upstream("Hello world")).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), 1000);

    let response = h.send(completion_request(&chat_body("hello", false))).await;
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("request id header")
        .to_string();
    read_body(response).await;
    assert_eq!(h.state.engine.pending_count(), 1);

    let confirm = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/proxy/confirm")
        .header("authorization", format!("Bearer {}", common::CLIENT_KEY))
        .body(Body::from(json!({ "request_id": request_id }).to_string()))
        .expect("confirm request");
    let response = h.send(confirm).await;
    assert_status(&response, StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["confirmed"], true);
    assert_eq!(payload["request_id"], request_id.as_str());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.saved_texts().is_empty());
    assert_eq!(h.state.engine.pending_count(), 0);

    server.abort();
}

#[tokio::test]
async fn test_connectivity_probe_is_never_saved() {
    let (base_url, server) = spawn_upstream(buffered_upstream("Hello! How can I help?")).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let probe = json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": "Hi" }]
    });
    let response = h.send(completion_request(&probe)).await;
    assert_status(&response, StatusCode::OK);
    read_body(response).await;

    assert_eq!(h.state.engine.pending_count(), 0);
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 3)).await;
    assert!(h.saved_texts().is_empty());
    assert_eq!(h.logged_records()[0]["isTest"], true);

    server.abort();
}

#[tokio::test]
async fn test_upstream_error_is_relayed_verbatim() {
    const ERROR_BODY: &str = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("content-type", "application/json")],
                ERROR_BODY,
            )
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let response = h.send(completion_request(&chat_body("hello", false))).await;
    assert_status(&response, StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("x-request-id"));
    let body = read_body(response).await;
    assert_eq!(body.as_ref(), ERROR_BODY.as_bytes());

    assert_eq!(h.state.engine.pending_count(), 0);
    let records = h.logged_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"], "error");
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 3)).await;
    assert!(h.saved_texts().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_unparseable_upstream_payload_is_parse_error() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { ([("content-type", "application/json")], "not json at all") }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let response = h.send(completion_request(&chat_body("hello", false))).await;
    assert_status(&response, StatusCode::INTERNAL_SERVER_ERROR);
    let payload = read_json(response).await;
    assert_eq!(payload["error"]["type"], "parse_error");
    assert_eq!(h.state.engine.pending_count(), 0);

    server.abort();
}

#[tokio::test]
async fn test_stream_failure_marks_capture_failed() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let frames: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(FRAMES[0])),
                Err(std::io::Error::other("upstream went away")),
            ];
            // Pace the frames so the first one is flushed before the failure.
            let paced = futures_util::stream::iter(frames).then(|frame| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                frame
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(paced))
                .expect("stream response")
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let response = h.send(completion_request(&chat_body("tell me", true))).await;
    assert_status(&response, StatusCode::OK);
    let relayed = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    assert!(relayed.is_err());

    assert!(wait_until(SETTLE, || h.logged_records().len() == 1).await);
    assert_eq!(h.logged_records()[0]["status"], "error");
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 3)).await;
    assert!(h.saved_texts().is_empty());
    assert_eq!(h.state.engine.pending_count(), 0);

    server.abort();
}

#[tokio::test]
async fn test_missing_upstream_key_is_configuration_error() {
    let h = harness("http://127.0.0.1:9/v1", None, WINDOW_MS);

    let response = h.send(completion_request(&chat_body("hello", false))).await;
    assert_status(&response, StatusCode::INTERNAL_SERVER_ERROR);
    let payload = read_json(response).await;
    assert_eq!(payload["error"]["type"], "configuration_error");
    assert_eq!(h.state.request_log.open_count(), 0);

    let records = h.logged_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"], "error");
    assert_eq!(records[0]["streaming"], false);
    assert!(records[0]["error"]
        .as_str()
        .is_some_and(|message| message.contains("Upstream API key is not configured")));
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let h = harness("http://127.0.0.1:9/v1", Some(UPSTREAM_KEY), WINDOW_MS);
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {}", common::CLIENT_KEY))
        .header("x-request-id", "broken-1")
        .body(Body::from("{\"messages\": ["))
        .expect("build request");

    let response = h.send(request).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("broken-1")
    );
    let payload = read_json(response).await;
    assert_eq!(payload["error"]["type"], "invalid_request_error");

    let records = h.logged_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "broken-1");
    assert_eq!(records[0]["status"], "error");
    assert_eq!(records[0]["model"], h.state.config.upstream.default_model.as_str());
}

#[tokio::test]
async fn test_synced_context_is_used_without_header() {
    let (base_url, server) = spawn_upstream(buffered_upstream("From the group")).await;
    let h = harness(&base_url, Some(UPSTREAM_KEY), WINDOW_MS);

    let sync = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/proxy/chat-context")
        .header("authorization", format!("Bearer {}", common::CLIENT_KEY))
        .body(Body::from(r#"{"group_id":"1700000000000"}"#))
        .expect("sync request");
    let response = h.send(sync).await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(read_json(response).await["resolvable"], true);

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {}", common::CLIENT_KEY))
        .body(Body::from(chat_body("hello", false).to_string()))
        .expect("build request");
    let response = h.send(request).await;
    assert_status(&response, StatusCode::OK);
    read_body(response).await;

    assert!(wait_until(SETTLE, || h.store.appends.lock().len() == 1).await);
    let append = h.store.appends.lock()[0].clone();
    assert_eq!(append.context.group_id.as_deref(), Some("1700000000000"));
    assert_eq!(append.message.text, "From the group");
    assert_eq!(append.message.name, "Assistant");

    server.abort();
}
