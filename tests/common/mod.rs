#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use parking_lot::Mutex;
use reply_guard::chat_store::{
    ChatContext, ChatDirectories, ChatStore, ChatStoreError, SavedMessage,
};
use reply_guard::config::AppConfig;
use reply_guard::routing::dispatch::dispatch_request;
use reply_guard::state::AppState;
use tempfile::TempDir;

pub const CLIENT_KEY: &str = "client-key";
pub const UPSTREAM_KEY: &str = "upstream-secret";
pub const CHAT_CONTEXT: &str =
    r#"{"avatar":"Seraphina.png","chat_file":"Seraphina - 2024-5-1","character_name":"Seraphina"}"#;

#[derive(Debug, Clone)]
pub struct SavedAppend {
    pub directories: ChatDirectories,
    pub context: ChatContext,
    pub message: SavedMessage,
}

/// Chat store that only remembers what it was asked to append.
#[derive(Default)]
pub struct RecordingStore {
    pub appends: Mutex<Vec<SavedAppend>>,
}

#[async_trait::async_trait]
impl ChatStore for RecordingStore {
    async fn append(
        &self,
        directories: &ChatDirectories,
        context: &ChatContext,
        message: &SavedMessage,
    ) -> Result<(), ChatStoreError> {
        self.appends.lock().push(SavedAppend {
            directories: directories.clone(),
            context: context.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<RecordingStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn saved_texts(&self) -> Vec<String> {
        self.store
            .appends
            .lock()
            .iter()
            .map(|append| append.message.text.clone())
            .collect()
    }

    pub fn request_log_path(&self) -> PathBuf {
        self.state.request_log.path().to_path_buf()
    }

    pub fn logged_records(&self) -> Vec<serde_json::Value> {
        std::fs::read_to_string(self.request_log_path())
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).expect("request log line"))
            .collect()
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        dispatch_request(Arc::clone(&self.state), Arc::<str>::from(""), request)
            .await
            .expect("dispatch")
    }
}

/// Build proxy state pointed at `base_url`. `None` leaves the upstream key
/// unset.
pub fn harness(base_url: &str, upstream_key: Option<&str>, window_ms: u64) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig::default();
    config.upstream.base_url = base_url.to_string();
    config.upstream.api_key = upstream_key.map(str::to_string);
    config.client_authentication.proxy_api_key = Some(CLIENT_KEY.to_string());
    config.persistence.data_root = Some(dir.path().join("data"));
    config.persistence.confirmation_window_ms = window_ms;
    config.request_log.path = dir.path().join("logs").join("requests.jsonl");

    let store = Arc::new(RecordingStore::default());
    let chat_store: Arc<dyn ChatStore> = store.clone();
    let state = Arc::new(AppState::new(config, chat_store).expect("state"));
    Harness { state, store, dir }
}

pub async fn spawn_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/v1"), server)
}

pub fn completion_request(body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {CLIENT_KEY}"))
        .header("content-type", "application/json")
        .header("x-chat-context", CHAT_CONTEXT)
        .body(Body::from(serde_json::to_vec(body).expect("serialize request")))
        .expect("build request")
}

pub async fn read_body(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body")
}

pub async fn read_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&read_body(response).await).expect("json body")
}

/// Poll `condition` every 10ms until it holds or `timeout` runs out.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_status(response: &Response, status: StatusCode) {
    assert_eq!(response.status(), status, "unexpected status");
}
