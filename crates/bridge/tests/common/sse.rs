use anyhow::Context as _;
use futures::{Stream, StreamExt as _};
use std::time::Duration;

pub type JsonEvents = std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<serde_json::Value>> + Send>>;

/// Decode an event-stream response into its JSON `data` payloads, skipping keep-alives.
pub fn json_events(resp: reqwest::Response) -> JsonEvents {
    let stream = sse_stream::SseStream::from_byte_stream(resp.bytes_stream()).filter_map(|evt| async move {
        match evt {
            Ok(evt) => {
                let payload = evt.data.unwrap_or_default();
                if payload.trim().is_empty() {
                    return None;
                }
                Some(serde_json::from_str(&payload).context("parse SSE data as JSON"))
            }
            Err(e) => Some(Err(anyhow::anyhow!("read SSE event: {e}"))),
        }
    });
    Box::pin(stream)
}

/// Next JSON event, failing after `timeout`.
pub async fn next_event(events: &mut JsonEvents, timeout: Duration) -> anyhow::Result<serde_json::Value> {
    tokio::time::timeout(timeout, events.next())
        .await
        .context("timed out waiting for SSE event")?
        .context("event-stream ended")?
}

/// Skip events until one with `"type": kind` arrives.
pub async fn wait_for(events: &mut JsonEvents, kind: &str, timeout: Duration) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        let evt = next_event(events, left).await?;
        if evt["type"] == kind {
            return Ok(evt);
        }
    }
}
