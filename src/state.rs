mod request_id;

use std::sync::Arc;

use http::HeaderMap;
use parking_lot::RwLock;

use crate::auth::{authenticate, build_proxy_key, ProxyKey};
use crate::chat_store::{ChatContext, ChatStore, JsonlChatStore};
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::reconcile::ReconciliationEngine;
use crate::request_log::RequestLog;
use crate::transport::UpstreamClient;

use request_id::RequestIdGenerator;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CHAT_CONTEXT_HEADER: &str = "x-chat-context";

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    pub engine: ReconciliationEngine,
    pub request_log: RequestLog,
    session: SessionState,
    infra: InfraState,
}

// Single most-recent context for the whole process; requests that carry
// their own context header never read it.
struct SessionState {
    last_chat_context: RwLock<Option<ChatContext>>,
}

struct InfraState {
    proxy_key: ProxyKey,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// Build state around an explicit chat store.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError` when the upstream client cannot be constructed.
    pub fn new(config: AppConfig, chat_store: Arc<dyn ChatStore>) -> Result<Self, ProxyError> {
        let upstream = UpstreamClient::new(&config.server, &config.upstream)?;
        let engine = ReconciliationEngine::new(&config.persistence, chat_store);
        let request_log = RequestLog::new(&config.request_log);
        let proxy_key = build_proxy_key(&config);

        Ok(Self {
            config,
            upstream,
            engine,
            request_log,
            session: SessionState {
                last_chat_context: RwLock::new(None),
            },
            infra: InfraState {
                proxy_key,
                request_ids: RequestIdGenerator::new(),
            },
        })
    }

    /// Build state that saves rescued replies as JSONL transcripts.
    ///
    /// # Errors
    ///
    /// See [`AppState::new`].
    pub fn from_config(config: AppConfig) -> Result<Self, ProxyError> {
        Self::new(config, Arc::new(JsonlChatStore))
    }

    /// # Errors
    ///
    /// Returns `ProxyError::Auth` when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        authenticate(headers, &self.infra.proxy_key)
    }

    #[must_use]
    pub fn next_request_id(&self) -> String {
        self.infra.request_ids.next_id()
    }

    /// The caller's `X-Request-Id` when it sent a usable one, otherwise a
    /// freshly generated id.
    #[must_use]
    pub fn request_id_for(&self, headers: &HeaderMap) -> String {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| self.next_request_id(), str::to_string)
    }

    pub fn sync_chat_context(&self, context: ChatContext) {
        tracing::debug!(destination = ?context.label(), "chat context synchronized");
        *self.session.last_chat_context.write() = Some(context);
    }

    #[must_use]
    pub fn last_chat_context(&self) -> Option<ChatContext> {
        self.session.last_chat_context.read().clone()
    }

    /// Context for one request: the `X-Chat-Context` header when it parses,
    /// the last synchronized context otherwise.
    #[must_use]
    pub fn resolve_chat_context(&self, headers: &HeaderMap) -> Option<ChatContext> {
        if let Some(raw) = headers.get(CHAT_CONTEXT_HEADER) {
            match serde_json::from_slice::<ChatContext>(raw.as_bytes()) {
                Ok(context) => return Some(context),
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring unparseable chat context header");
                }
            }
        }
        self.last_chat_context()
    }
}
