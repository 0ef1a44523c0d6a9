//! Decides, once per completion, whether a captured reply must be rescued,
//! and runs the confirm-versus-deadline race for the ones that must.
//!
//! Per request the flow is `CAPTURING -> EVALUATING -> {SKIPPED |
//! PENDING_CONFIRMATION} -> {CONFIRMED | SAVED}`. Capturing happens in the
//! forwarder; everything from evaluation on lives here.

mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::chat_store::{ChatContext, ChatDirectories, ChatStore, SavedMessage};
use crate::config::PersistenceConfig;

pub use registry::{PendingSaveEntry, PendingSaveRegistry};

const TEST_MESSAGE_CONTENT: &str = "Hi";

/// `true` when the request is the host application's connectivity probe:
/// exactly one message, from the user, whose content is exactly `"Hi"`.
#[must_use]
pub fn is_test_message(request: &Value) -> bool {
    let Some(messages) = request.get("messages").and_then(Value::as_array) else {
        return false;
    };
    let [only] = messages.as_slice() else {
        return false;
    };
    only.get("role").and_then(Value::as_str) == Some("user")
        && only.get("content").and_then(Value::as_str) == Some(TEST_MESSAGE_CONTENT)
}

/// Everything known about a completion once its capture has ended.
#[derive(Debug, Clone)]
pub struct FinishedCapture {
    pub request_id: String,
    pub model: String,
    pub text: String,
    pub has_error: bool,
    pub is_test: bool,
    pub chat_context: Option<ChatContext>,
    pub generation_started: DateTime<Utc>,
    pub generation_finished: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PersistenceDisabled,
    CaptureFailed,
    EmptyText,
    NoDestination,
    TestMessage,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::PersistenceDisabled => "persistence_disabled",
            SkipReason::CaptureFailed => "capture_failed",
            SkipReason::EmptyText => "empty_text",
            SkipReason::NoDestination => "no_destination",
            SkipReason::TestMessage => "test_message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skipped(SkipReason),
    /// Registered; `replaced` is set when an earlier registration for the
    /// same request id was cancelled to make room.
    PendingConfirmation { replaced: bool },
}

pub struct ReconciliationEngine {
    registry: PendingSaveRegistry,
    store: Arc<dyn ChatStore>,
    directories: Option<ChatDirectories>,
    window: Duration,
    enabled: bool,
    assistant_name: String,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(config: &PersistenceConfig, store: Arc<dyn ChatStore>) -> Self {
        Self {
            registry: PendingSaveRegistry::new(),
            store,
            directories: config
                .data_root
                .as_deref()
                .map(ChatDirectories::from_data_root),
            window: Duration::from_millis(config.confirmation_window_ms),
            enabled: config.enabled,
            assistant_name: config.assistant_name.clone(),
        }
    }

    #[must_use]
    pub fn confirmation_window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.registry.contains(request_id)
    }

    fn evaluate(&self, capture: FinishedCapture) -> Result<PendingSaveEntry, SkipReason> {
        if !self.enabled {
            return Err(SkipReason::PersistenceDisabled);
        }
        if capture.has_error {
            return Err(SkipReason::CaptureFailed);
        }
        if capture.text.is_empty() {
            return Err(SkipReason::EmptyText);
        }
        let (Some(chat_context), Some(directories)) = (capture.chat_context, &self.directories)
        else {
            return Err(SkipReason::NoDestination);
        };
        if chat_context.destination().is_none() {
            return Err(SkipReason::NoDestination);
        }
        if capture.is_test {
            return Err(SkipReason::TestMessage);
        }

        Ok(PendingSaveEntry {
            request_id: capture.request_id,
            captured_text: capture.text,
            model_name: capture.model,
            generation_started: capture.generation_started,
            generation_finished: capture.generation_finished,
            chat_context,
            destination_directories: directories.clone(),
        })
    }

    /// Evaluate a finished capture and, when it qualifies, register it for
    /// saving once the confirmation window runs out.
    pub fn finish_capture(&self, capture: FinishedCapture) -> Decision {
        let request_id = capture.request_id.clone();
        let entry = match self.evaluate(capture) {
            Ok(entry) => entry,
            Err(reason) => {
                tracing::debug!(request_id = %request_id, reason = reason.as_str(), "pending save skipped");
                return Decision::Skipped(reason);
            }
        };

        let captured_len = entry.captured_text.len();
        let store = Arc::clone(&self.store);
        let name = entry
            .chat_context
            .character_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.assistant_name.clone());
        let replaced = self.registry.schedule(entry, self.window, move |entry| {
            save_entry(store, entry, name)
        });

        tracing::info!(
            request_id = %request_id,
            captured_len,
            window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            replaced,
            "pending save registered"
        );
        Decision::PendingConfirmation { replaced }
    }

    /// Apply a "received" signal from the caller.
    ///
    /// With a request id the matching entry is cancelled; without one the
    /// most recently registered entry is. Returns the id that was cancelled.
    pub fn confirm(&self, request_id: Option<&str>) -> Option<String> {
        let confirmed = match request_id {
            Some(id) => self.registry.cancel(id).then(|| id.to_string()),
            None => self.registry.cancel_latest(),
        };
        match &confirmed {
            Some(id) => tracing::info!(request_id = %id, "reply confirmed, pending save cancelled"),
            None => tracing::debug!(?request_id, "confirmation matched no pending save"),
        }
        confirmed
    }
}

async fn save_entry(store: Arc<dyn ChatStore>, entry: PendingSaveEntry, name: String) {
    let message = SavedMessage {
        name,
        text: entry.captured_text,
        model: entry.model_name,
        request_id: entry.request_id,
        generation_started: entry.generation_started,
        generation_finished: entry.generation_finished,
    };
    match store
        .append(&entry.destination_directories, &entry.chat_context, &message)
        .await
    {
        Ok(()) => tracing::info!(
            request_id = %message.request_id,
            captured_len = message.text.len(),
            "unconfirmed reply saved to transcript"
        ),
        Err(err) => tracing::error!(
            request_id = %message.request_id,
            error = %err,
            "failed to save unconfirmed reply"
        ),
    }
}
