pub mod forward;
pub mod sse;

pub use forward::{relay_with_capture, Capture};
pub use sse::{extract_deltas, extract_line_delta, DeltaCollector};

use serde::Deserialize;

#[derive(Deserialize)]
struct CompletionPayload {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the first choice's message text out of a buffered completion body.
///
/// A well-formed payload without text yields an empty string.
///
/// # Errors
///
/// Returns the JSON error when the body is not a completion object.
pub fn extract_message_text(body: &[u8]) -> Result<String, serde_json::Error> {
    let payload: CompletionPayload = serde_json::from_slice(body)?;
    Ok(payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .unwrap_or_default())
}
