//! Assistant-text extraction from OpenAI chat-completion event streams.
//!
//! Extraction is a side observation of the relayed bytes: it never alters
//! what the caller receives and never fails the stream. Lines that are not
//! `data:` frames, the `[DONE]` sentinel, and frames whose JSON does not parse
//! are skipped silently.

use memchr::memchr_iter;
use serde::Deserialize;
use smallvec::SmallVec;

const DATA_PREFIX: &[u8] = b"data:";
const DONE_SENTINEL: &[u8] = b"[DONE]";

#[derive(Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    choices: SmallVec<[ChunkChoice; 1]>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the delta text carried by a single SSE line, if any.
///
/// A trailing `\r` is tolerated. Returns `None` for non-data lines, the
/// termination sentinel, unparseable JSON and frames without text.
#[must_use]
pub fn extract_line_delta(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if memchr::memmem::find(payload, DONE_SENTINEL).is_some() {
        return None;
    }
    let frame: ChunkFrame = serde_json::from_slice(payload).ok()?;
    frame
        .choices
        .into_iter()
        .next()?
        .delta?
        .content
        .filter(|content| !content.is_empty())
}

/// Lazily extract every text fragment contained in one raw chunk.
///
/// The chunk is treated on its own: a frame split across two chunks is lost.
/// Use [`DeltaCollector`] when chunks of one stream should be stitched back
/// together first.
pub fn extract_deltas(chunk: &str) -> impl Iterator<Item = String> + '_ {
    chunk
        .split('\n')
        .filter_map(|line| extract_line_delta(line.as_bytes()))
}

/// Accumulates the full assistant text of one stream, in arrival order.
///
/// Complete lines are extracted as soon as they arrive; an incomplete trailing
/// line is held back and joined with the next chunk, so frames (and UTF-8
/// sequences) split across reads are still recovered.
#[derive(Debug, Default)]
pub struct DeltaCollector {
    partial_line: Vec<u8>,
    text: String,
    fragments: usize,
}

impl DeltaCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk exactly as it was received from upstream.
    pub fn feed(&mut self, chunk: &[u8]) {
        let mut line_start = 0usize;
        for line_end in memchr_iter(b'\n', chunk) {
            let segment = &chunk[line_start..line_end];
            if self.partial_line.is_empty() {
                self.push_line(segment);
            } else {
                let mut joined = std::mem::take(&mut self.partial_line);
                joined.extend_from_slice(segment);
                self.push_line(&joined);
            }
            line_start = line_end + 1;
        }
        self.partial_line.extend_from_slice(&chunk[line_start..]);
    }

    fn push_line(&mut self, line: &[u8]) {
        if let Some(fragment) = extract_line_delta(line) {
            self.text.push_str(&fragment);
            self.fragments += 1;
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// Flush a final unterminated line and return the captured text.
    #[must_use]
    pub fn finish(mut self) -> String {
        if !self.partial_line.is_empty() {
            let last = std::mem::take(&mut self.partial_line);
            self.push_line(&last);
        }
        self.text
    }
}
