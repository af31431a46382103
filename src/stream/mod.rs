//! Streaming sink for run progress events.
//!
//! The runtime narrates task lifecycle through a [`StreamSink`]; the sink
//! is never load-bearing: a full channel or a dropped subscriber must not
//! stall the run. [`NullSink`] is the default; [`ChannelSink`] fans events
//! into a bounded tokio channel with a receiver-stream subscription
//! surface for UIs and tests.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Logical channel, e.g. `task` or `planner`.
    pub channel: String,
    /// Emitting source, e.g. a task id.
    pub source: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// Event payload.
    pub payload: Value,
}

/// Where run progress goes.
pub trait StreamSink: Send + Sync {
    /// Emit an event. Must not block the run.
    fn emit(&self, channel: &str, source: &str, payload: Value);

    /// Signal that a source will emit no further events.
    fn close(&self, source: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StreamSink for NullSink {
    fn emit(&self, _channel: &str, _source: &str, _payload: Value) {}

    fn close(&self, _source: &str) {}
}

/// Bounded-channel sink. Events overflowing the buffer are dropped (with
/// a debug log), never awaited.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink").finish_non_exhaustive()
    }
}

impl ChannelSink {
    /// Sink buffering up to `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Take the subscription stream. Single-consumer: the first caller
    /// gets the stream, later callers get `None`.
    pub fn subscribe(&self) -> Option<ReceiverStream<StreamEvent>> {
        self.rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(ReceiverStream::new)
    }
}

impl StreamSink for ChannelSink {
    fn emit(&self, channel: &str, source: &str, payload: Value) {
        let event = StreamEvent {
            channel: channel.to_owned(),
            source: source.to_owned(),
            ts: Utc::now().timestamp_millis(),
            payload,
        };
        if self.tx.try_send(event).is_err() {
            debug!(channel, source, "stream buffer full, dropping event");
        }
    }

    fn close(&self, source: &str) {
        self.emit("lifecycle", source, serde_json::json!({"closed": true}));
    }
}
