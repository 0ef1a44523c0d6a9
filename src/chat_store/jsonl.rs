use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::{ChatContext, ChatDirectories, ChatStore, ChatStoreError, Destination, SavedMessage};

const TRANSCRIPT_EXTENSION: &str = ".jsonl";

/// Appends rescued replies as JSON lines to per-character or per-group
/// transcript files.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlChatStore;

#[derive(Serialize)]
struct TranscriptLine<'a> {
    name: &'a str,
    is_user: bool,
    is_system: bool,
    send_date: String,
    mes: &'a str,
    extra: TranscriptExtra<'a>,
    gen_started: String,
    gen_finished: String,
}

#[derive(Serialize)]
struct TranscriptExtra<'a> {
    api: &'static str,
    model: &'a str,
    request_id: &'a str,
    rescued: bool,
}

fn checked_component<'a>(kind: &str, value: &'a str) -> Result<&'a str, ChatStoreError> {
    let invalid = value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0');
    if invalid {
        return Err(ChatStoreError::InvalidDestination(format!(
            "{kind} '{value}' is not a plain file name"
        )));
    }
    Ok(value)
}

fn transcript_file_name(file: &str) -> Result<String, ChatStoreError> {
    let stem = file.strip_suffix(TRANSCRIPT_EXTENSION).unwrap_or(file);
    let stem = checked_component("chat file", stem)?;
    Ok(format!("{stem}{TRANSCRIPT_EXTENSION}"))
}

/// Compute the transcript path for `context` under `directories`.
///
/// # Errors
///
/// Returns [`ChatStoreError::InvalidDestination`] when the context names no
/// transcript or a component would escape its directory.
pub fn transcript_path(
    directories: &ChatDirectories,
    context: &ChatContext,
) -> Result<PathBuf, ChatStoreError> {
    match context.destination() {
        Some(Destination::Group { file }) => {
            Ok(directories.group_chats.join(transcript_file_name(file)?))
        }
        Some(Destination::Character { dir, file }) => {
            let dir = checked_component("character directory", &dir)?;
            Ok(directories
                .chats
                .join(dir)
                .join(transcript_file_name(file)?))
        }
        None => Err(ChatStoreError::InvalidDestination(
            "no group or character chat".to_string(),
        )),
    }
}

fn render_line(path: &Path, message: &SavedMessage) -> Result<Vec<u8>, ChatStoreError> {
    let line = TranscriptLine {
        name: &message.name,
        is_user: false,
        is_system: false,
        send_date: message.generation_finished.to_rfc3339(),
        mes: &message.text,
        extra: TranscriptExtra {
            api: "openai",
            model: &message.model,
            request_id: &message.request_id,
            rescued: true,
        },
        gen_started: message.generation_started.to_rfc3339(),
        gen_finished: message.generation_finished.to_rfc3339(),
    };
    let mut bytes = serde_json::to_vec(&line).map_err(|source| ChatStoreError::JsonSerialize {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[async_trait::async_trait]
impl ChatStore for JsonlChatStore {
    async fn append(
        &self,
        directories: &ChatDirectories,
        context: &ChatContext,
        message: &SavedMessage,
    ) -> Result<(), ChatStoreError> {
        let path = transcript_path(directories, context)?;
        let bytes = render_line(&path, message)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ChatStoreError::io("creating transcript directory", parent, source))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| ChatStoreError::io("opening transcript for append", &path, source))?;
        file.write_all(&bytes)
            .await
            .map_err(|source| ChatStoreError::io("appending to transcript", &path, source))?;
        file.flush()
            .await
            .map_err(|source| ChatStoreError::io("flushing transcript", &path, source))?;
        Ok(())
    }
}
