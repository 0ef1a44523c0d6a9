//! Durable transcript collaborator used when a rescued reply must be saved.

mod jsonl;

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use jsonl::JsonlChatStore;

const CHATS_DIR: &str = "chats";
const GROUP_CHATS_DIR: &str = "group chats";

#[derive(Debug, thiserror::Error)]
pub enum ChatStoreError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize transcript line for {path}: {source}")]
    JsonSerialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("chat context does not name a usable transcript: {0}")]
    InvalidDestination(String),
}

impl ChatStoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Resolved storage roots for character and group transcripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDirectories {
    pub chats: PathBuf,
    pub group_chats: PathBuf,
}

impl ChatDirectories {
    #[must_use]
    pub fn from_data_root(root: &Path) -> Self {
        Self {
            chats: root.join(CHATS_DIR),
            group_chats: root.join(GROUP_CHATS_DIR),
        }
    }
}

/// Identifies the transcript a reply belongs to.
///
/// Either a group chat, or a character chat addressed by the character's
/// directory (given directly or derived from its avatar file) plus a chat
/// file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination<'a> {
    Group { file: &'a str },
    Character { dir: Cow<'a, str>, file: &'a str },
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl ChatContext {
    /// Resolve where this context's transcript lives, if it names one.
    #[must_use]
    pub fn destination(&self) -> Option<Destination<'_>> {
        if let Some(group_id) = non_empty(self.group_id.as_ref()) {
            let file = non_empty(self.chat_file.as_ref()).unwrap_or(group_id);
            return Some(Destination::Group { file });
        }

        let file = non_empty(self.chat_file.as_ref())?;
        if let Some(dir) = non_empty(self.character_dir.as_ref()) {
            return Some(Destination::Character {
                dir: Cow::Borrowed(dir),
                file,
            });
        }
        let avatar = non_empty(self.avatar.as_ref())?;
        let stem = Path::new(avatar).file_stem()?.to_string_lossy();
        if stem.is_empty() {
            return None;
        }
        Some(Destination::Character { dir: stem, file })
    }

    /// Short label for logs and request records.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        if let Some(name) = non_empty(self.character_name.as_ref()) {
            return Some(name.to_string());
        }
        match self.destination()? {
            Destination::Group { file } => Some(format!("group:{file}")),
            Destination::Character { dir, .. } => Some(dir.into_owned()),
        }
    }
}

/// A finished assistant message ready to be appended to a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMessage {
    pub name: String,
    pub text: String,
    pub model: String,
    pub request_id: String,
    pub generation_started: DateTime<Utc>,
    pub generation_finished: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
    /// Append one message to the transcript identified by `context`.
    async fn append(
        &self,
        directories: &ChatDirectories,
        context: &ChatContext,
        message: &SavedMessage,
    ) -> Result<(), ChatStoreError>;
}
