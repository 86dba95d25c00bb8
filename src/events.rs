//! Publishing seam for storage events. Delivery guarantees belong to the sink.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::StorageEvent;

pub trait StorageEventSink: Send + Sync {
    /// Fire-and-forget from the core's perspective.
    fn emit(&self, event: StorageEvent);

    fn emit_all(&self, events: Vec<StorageEvent>) {
        for e in events {
            self.emit(e);
        }
    }
}

pub type SharedSink = Arc<dyn StorageEventSink>;

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StorageEventSink for NoopSink {
    fn emit(&self, _event: StorageEvent) {}
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StorageEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn events(&self) -> Vec<StorageEvent> { self.events.lock().clone() }

    pub fn len(&self) -> usize { self.events.lock().len() }

    pub fn is_empty(&self) -> bool { self.events.lock().is_empty() }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<StorageEvent> { std::mem::take(&mut *self.events.lock()) }
}

impl StorageEventSink for RecordingSink {
    fn emit(&self, event: StorageEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to an async consumer (e.g. a bus publisher task).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StorageEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StorageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StorageEventSink for ChannelSink {
    fn emit(&self, event: StorageEvent) {
        if self.tx.send(event).is_err() {
            warn!(target: "storage::events", "event receiver dropped; discarding event");
        }
    }
}
