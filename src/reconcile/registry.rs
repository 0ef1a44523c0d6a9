use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::AbortHandle;

use crate::chat_store::{ChatContext, ChatDirectories};

/// One generated reply that the caller has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct PendingSaveEntry {
    pub request_id: String,
    pub captured_text: String,
    pub model_name: String,
    pub generation_started: DateTime<Utc>,
    pub generation_finished: DateTime<Utc>,
    pub chat_context: ChatContext,
    pub destination_directories: ChatDirectories,
}

struct PendingSlot {
    generation: u64,
    deadline: AbortHandle,
}

#[derive(Default)]
struct RegistryInner {
    slots: FxHashMap<String, PendingSlot>,
    next_generation: u64,
}

impl RegistryInner {
    fn take_if_current(&mut self, request_id: &str, generation: u64) -> bool {
        match self.slots.get(request_id) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(request_id);
                true
            }
            _ => false,
        }
    }
}

/// Table of in-flight pending saves, each guarded by a cancellable deadline.
///
/// At most one deadline is live per request id. Whoever removes a slot from
/// the table under the lock owns the outcome: the deadline task removes it
/// before doing any I/O, and cancellation removes it before aborting the
/// task, so a save and a cancellation can never both win.
#[derive(Clone, Default)]
pub struct PendingSaveRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl PendingSaveRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` and arm its deadline.
    ///
    /// When `window` elapses without a cancellation, `on_deadline` receives
    /// the entry exactly once. An existing registration for the same request
    /// id is cancelled first; returns `true` in that case.
    pub fn schedule<F, Fut>(&self, entry: PendingSaveEntry, window: Duration, on_deadline: F) -> bool
    where
        F: FnOnce(PendingSaveEntry) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let replaced = match inner.slots.remove(&entry.request_id) {
            Some(previous) => {
                previous.deadline.abort();
                true
            }
            None => false,
        };

        let request_id = entry.request_id.clone();
        let registry = Arc::clone(&self.inner);
        // The lock is still held here, so the task cannot observe the table
        // before its own slot is installed.
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let current = registry
                .lock()
                .take_if_current(&entry.request_id, generation);
            if !current {
                return;
            }
            on_deadline(entry).await;
        });

        inner.slots.insert(
            request_id,
            PendingSlot {
                generation,
                deadline: task.abort_handle(),
            },
        );
        replaced
    }

    /// Cancel the pending save for `request_id`. Returns `false` when nothing
    /// was pending (never registered, already confirmed, or already firing).
    pub fn cancel(&self, request_id: &str) -> bool {
        let slot = self.inner.lock().slots.remove(request_id);
        match slot {
            Some(slot) => {
                slot.deadline.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel whichever pending save was registered last.
    pub fn cancel_latest(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let latest = inner
            .slots
            .iter()
            .max_by_key(|(_, slot)| slot.generation)
            .map(|(id, _)| id.clone())?;
        if let Some(slot) = inner.slots.remove(&latest) {
            slot.deadline.abort();
        }
        Some(latest)
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().slots.contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
