use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::sse::DeltaCollector;
use crate::error::ProxyError;

const RELAY_CHANNEL_CAPACITY: usize = 32;

/// What the forwarder reconstructed from one upstream stream.
#[derive(Debug, Clone)]
pub struct Capture {
    pub text: String,
    pub has_error: bool,
    pub error: Option<String>,
    pub caller_disconnected: bool,
    pub finished_at: DateTime<Utc>,
}

/// Relay `upstream` to the caller while rebuilding the assistant text.
///
/// The upstream body is drained by a spawned pump task. Each chunk is handed
/// to the caller's body channel before it is fed to the extractor, and the
/// bytes are forwarded untouched. When the caller goes away the pump keeps
/// reading so the capture still completes. An upstream read error is pushed
/// into the caller body, which aborts the caller connection.
///
/// `on_finish` runs exactly once, on the pump task, after the upstream body
/// has ended or failed.
pub fn relay_with_capture<S, E, F, Fut>(upstream: S, on_finish: F) -> axum::body::Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce(Capture) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RELAY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let capture = pump(upstream, tx).await;
        on_finish(capture).await;
    });

    let caller_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    axum::body::Body::from_stream(caller_stream)
}

async fn pump<S, E>(upstream: S, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) -> Capture
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut collector = DeltaCollector::new();
    let mut caller_open = true;
    let mut error = None;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(chunk) => {
                if caller_open && tx.send(Ok(chunk.clone())).await.is_err() {
                    caller_open = false;
                    tracing::debug!("caller disconnected mid-stream, continuing capture");
                }
                collector.feed(&chunk);
            }
            Err(err) => {
                let err = ProxyError::Stream(err.to_string());
                let message = err.to_string();
                tracing::warn!(error = %message, "upstream stream failed");
                if caller_open {
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                }
                error = Some(message);
                break;
            }
        }
    }
    drop(tx);

    Capture {
        has_error: error.is_some(),
        error,
        caller_disconnected: !caller_open,
        text: collector.finish(),
        finished_at: Utc::now(),
    }
}
