//! Event sinks.

use super::RunEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

/// Receives lifecycle events from the scheduler.
///
/// `record` is called from the scheduling loop and must not block or panic.
pub trait EventSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: &RunEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn record(&self, _event: &RunEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level. Anything below `INFO` logs
    /// at `DEBUG`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn record(&self, event: &RunEvent) {
        let payload = event.payload();
        if self.level > Level::INFO {
            debug!(event_type = event.event_type(), run_id = %event.run_id(), payload = %payload, "Run event");
        } else {
            info!(event_type = event.event_type(), run_id = %event.run_id(), payload = %payload, "Run event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type starts with `type_prefix`, e.g. `stage.`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn record(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }
}

/// Forwards events to an async consumer over a bounded channel.
///
/// When the consumer falls behind, events are dropped and counted rather
/// than stalling the scheduler.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<RunEvent>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Returns the number of events dropped because the channel was full
    /// or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn record(&self, event: &RunEvent) {
        if let Err(err) = self.tx.try_send(event.clone()) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(event_type = event.event_type(), dropped = total, error = %err, "Event dropped");
        }
    }
}
