//! Per-request bookkeeping: open records live in a bounded in-memory ring,
//! finished records are appended to a JSON-lines file that is trimmed from
//! the front once it grows past its size cap.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::RequestLogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    pub status: RequestStatus,
    pub streaming: bool,
    pub is_test: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    #[must_use]
    pub fn pending(
        id: impl Into<String>,
        model: impl Into<String>,
        character: Option<String>,
        streaming: bool,
        is_test: bool,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            model: model.into(),
            character,
            status: RequestStatus::Pending,
            streaming,
            is_test,
            response_time_ms: None,
            error: None,
        }
    }
}

pub struct RequestLog {
    open: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
    path: PathBuf,
    max_bytes: u64,
    trim_ratio: f64,
    // Serializes append + rotate so two finishing requests never interleave.
    file_lock: tokio::sync::Mutex<()>,
}

impl RequestLog {
    #[must_use]
    pub fn new(config: &RequestLogConfig) -> Self {
        Self {
            open: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
            capacity: config.ring_capacity.max(1),
            path: config.path.clone(),
            max_bytes: config.max_bytes,
            trim_ratio: config.trim_ratio,
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Track a newly arrived request. The ring is most-recent-first; when it
    /// is full the oldest open record is dropped.
    pub fn open(&self, record: RequestRecord) {
        let mut open = self.open.lock();
        open.push_front(record);
        while open.len() > self.capacity {
            if let Some(evicted) = open.pop_back() {
                tracing::warn!(request_id = %evicted.id, "request log ring full, dropping open record");
            }
        }
    }

    /// Open records, most recent first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.open.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Close the record for `id` and move it into the log file.
    ///
    /// Closing happens at most once: a second call, or a call for a record
    /// that was evicted from the ring, finds nothing and is ignored. File
    /// errors are logged, never returned.
    pub async fn close(
        &self,
        id: &str,
        status: RequestStatus,
        response_time_ms: u64,
        error: Option<String>,
    ) -> Option<RequestRecord> {
        let mut record = {
            let mut open = self.open.lock();
            let index = open.iter().position(|record| record.id == id)?;
            open.remove(index)?
        };
        record.status = status;
        record.response_time_ms = Some(response_time_ms);
        record.error = error;

        if let Err(err) = self.append(&record).await {
            tracing::error!(request_id = %id, error = %err, path = %self.path.display(), "failed to write request log");
        }
        Some(record)
    }

    async fn append(&self, record: &RequestRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = self.file_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        drop(file);

        if rotate_if_oversized(&self.path, self.max_bytes, self.trim_ratio).await? {
            tracing::debug!(path = %self.path.display(), "request log rotated");
        }
        Ok(())
    }
}

/// Number of leading lines dropped when `total` lines are trimmed by `ratio`.
/// Drops at least one line so an oversized file shrinks, but never the last
/// one: the newest record survives even when it alone exceeds the cap.
#[must_use]
pub fn lines_to_drop(total: usize, ratio: f64) -> usize {
    if total <= 1 {
        return 0;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let dropped = (total as f64 * ratio).ceil() as usize;
    dropped.clamp(1, total - 1)
}

/// Rewrite `path` without its oldest lines once it exceeds `max_bytes`.
///
/// Returns `true` when the file was rewritten. Remaining lines keep their
/// original order; the rewrite goes through a sibling temp file and a rename.
///
/// # Errors
///
/// Returns the underlying I/O error from reading, writing or renaming.
pub async fn rotate_if_oversized(path: &Path, max_bytes: u64, ratio: f64) -> std::io::Result<bool> {
    let size = tokio::fs::metadata(path).await?.len();
    if size <= max_bytes {
        return Ok(false);
    }

    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.lines().filter(|line| !line.is_empty()).collect();
    let dropped = lines_to_drop(lines.len(), ratio);
    if dropped == 0 {
        return Ok(false);
    }

    let mut kept = String::with_capacity(contents.len());
    for line in &lines[dropped..] {
        kept.push_str(line);
        kept.push('\n');
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, kept).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(true)
}
