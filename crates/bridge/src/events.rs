//! Invocation and catalog events for SSE subscribers.
//!
//! Events go through a bounded `tokio::sync::broadcast` channel. A subscriber that falls behind
//! loses the oldest events and is told how many via [`BridgeEvent::EventsDropped`]; publishers
//! never wait for subscribers.

use futures::Stream;
use oamcp_openapi_tools::dispatcher::{ErrorKind, ToolResult};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// First event on every SSE connection. Never broadcast.
    Connected {
        server: String,
        version: String,
        tools: usize,
        #[serde(rename = "catalogHash")]
        catalog_hash: String,
    },
    InvocationStarted {
        #[serde(rename = "invocationId")]
        invocation_id: String,
        tool: String,
    },
    InvocationCompleted {
        #[serde(rename = "invocationId")]
        invocation_id: String,
        tool: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        /// The caller went away before the result was ready.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        cancelled: bool,
    },
    CatalogUpdated {
        tools: usize,
        #[serde(rename = "catalogHash")]
        catalog_hash: String,
    },
    /// The subscriber lagged and `count` older events were discarded.
    EventsDropped { count: u64 },
}

impl BridgeEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::Connected { .. } => "connected",
            BridgeEvent::InvocationStarted { .. } => "invocation_started",
            BridgeEvent::InvocationCompleted { .. } => "invocation_completed",
            BridgeEvent::CatalogUpdated { .. } => "catalog_updated",
            BridgeEvent::EventsDropped { .. } => "events_dropped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber backlog; zero is bumped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Best-effort: with no subscribers the event is discarded.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Pairs every `invocation_started` with exactly one `invocation_completed`.
///
/// Dropping the guard without [`InvocationEvents::finish`] (the HTTP caller disconnected)
/// publishes a cancelled completion.
pub struct InvocationEvents {
    bus: EventBus,
    invocation_id: String,
    tool: String,
    started: Instant,
    finished: bool,
}

impl InvocationEvents {
    /// Publish `invocation_started` for `tool` under a fresh invocation id.
    #[must_use]
    pub fn start(bus: &EventBus, tool: &str) -> Self {
        let invocation_id = Uuid::new_v4().to_string();
        bus.publish(BridgeEvent::InvocationStarted {
            invocation_id: invocation_id.clone(),
            tool: tool.to_string(),
        });
        Self {
            bus: bus.clone(),
            invocation_id,
            tool: tool.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    #[must_use]
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Publish the completion for `result`. Returns the elapsed milliseconds.
    pub fn finish(mut self, result: &ToolResult) -> u64 {
        self.finished = true;
        let duration_ms = self.elapsed_ms();
        self.bus.publish(BridgeEvent::InvocationCompleted {
            invocation_id: self.invocation_id.clone(),
            tool: self.tool.clone(),
            ok: result.is_success(),
            status: result.status,
            error_kind: result.error.as_ref().map(|e| e.kind),
            duration_ms,
            cancelled: false,
        });
        duration_ms
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Drop for InvocationEvents {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let duration_ms = self.elapsed_ms();
        tracing::info!(
            tool = %self.tool,
            invocation_id = %self.invocation_id,
            duration_ms,
            "tool invocation abandoned by caller"
        );
        self.bus.publish(BridgeEvent::InvocationCompleted {
            invocation_id: std::mem::take(&mut self.invocation_id),
            tool: std::mem::take(&mut self.tool),
            ok: false,
            status: None,
            error_kind: None,
            duration_ms,
            cancelled: true,
        });
    }
}

/// Adapt a subscription into a stream that ends on `shutdown` or when the bus is dropped.
///
/// Lag is reported in-band as [`BridgeEvent::EventsDropped`].
pub fn subscription_stream(
    rx: broadcast::Receiver<BridgeEvent>,
    shutdown: CancellationToken,
) -> impl Stream<Item = BridgeEvent> + Send + 'static {
    futures::stream::unfold((rx, shutdown), |(mut rx, shutdown)| async move {
        let next = tokio::select! {
            () = shutdown.cancelled() => return None,
            res = rx.recv() => res,
        };
        match next {
            Ok(event) => Some((event, (rx, shutdown))),
            Err(RecvError::Lagged(count)) => {
                tracing::debug!(count, "SSE subscriber lagged; dropped oldest events");
                Some((BridgeEvent::EventsDropped { count }, (rx, shutdown)))
            }
            Err(RecvError::Closed) => None,
        }
    })
}
