//! Event bus for engine notifications
//!
//! Events are sent from the engine to any consumer (dashboard, logger,
//! automation) to report state changes, output changes, node errors and
//! run completion. Delivery never blocks the engine: every sink must
//! accept events without waiting, and the channel-backed subscriptions
//! are unbounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::graph::GraphChange;
use crate::state::EngineState;

/// Trait for receiving engine events
///
/// Implementations must not block; the engine calls `send` from inside
/// propagation passes and control paths.
pub trait EventSink: Send + Sync {
    /// Returns an error if the event could not be delivered (e.g., channel closed).
    /// Failing sinks are dropped from the bus.
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Subscription categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    StateChanged,
    OutputChanged,
    NodeError,
    RunCompleted,
    GraphChanged,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::StateChanged,
        EventCategory::OutputChanged,
        EventCategory::NodeError,
        EventCategory::RunCompleted,
        EventCategory::GraphChanged,
    ];
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// The run controller moved between states
    #[serde(rename_all = "camelCase")]
    StateChanged {
        from: EngineState,
        to: EngineState,
        elapsed_ms: u64,
    },

    /// A data output took a new value
    #[serde(rename_all = "camelCase")]
    OutputChanged {
        node_id: String,
        port_index: usize,
        port_name: String,
        value: serde_json::Value,
        elapsed_ms: u64,
    },

    /// A node recorded an error in its error slot
    #[serde(rename_all = "camelCase")]
    NodeError {
        node_id: String,
        message: String,
        elapsed_ms: u64,
    },

    /// Every control path finished without error
    #[serde(rename_all = "camelCase")]
    RunCompleted { run_id: String, elapsed_ms: u64 },

    /// The graph was edited
    #[serde(rename_all = "camelCase")]
    GraphChanged { change: GraphChange },
}

impl EngineEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::StateChanged { .. } => EventCategory::StateChanged,
            Self::OutputChanged { .. } => EventCategory::OutputChanged,
            Self::NodeError { .. } => EventCategory::NodeError,
            Self::RunCompleted { .. } => EventCategory::RunCompleted,
            Self::GraphChanged { .. } => EventCategory::GraphChanged,
        }
    }

    /// Create an output-changed event
    pub fn output_changed(
        node_id: &str,
        port_index: usize,
        port_name: &str,
        value: serde_json::Value,
        elapsed_ms: u64,
    ) -> Self {
        Self::OutputChanged {
            node_id: node_id.to_string(),
            port_index,
            port_name: port_name.to_string(),
            value,
            elapsed_ms,
        }
    }

    /// Create a node error event
    pub fn node_error(node_id: &str, message: &str, elapsed_ms: u64) -> Self {
        Self::NodeError {
            node_id: node_id.to_string(),
            message: message.to_string(),
            elapsed_ms,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Sink that forwards into an unbounded channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}

/// Receiving end of a bus subscription
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event delivered so far
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

struct Subscriber {
    id: u64,
    categories: Vec<EventCategory>,
    sink: Arc<dyn EventSink>,
}

/// Fan-out of engine events to filtered subscribers
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to the given categories; an empty slice means all
    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.attach(categories, Arc::new(ChannelEventSink::new(tx)));
        Subscription { id, rx }
    }

    /// Attach an arbitrary sink; an empty slice means all categories
    pub fn attach(&self, categories: &[EventCategory], sink: Arc<dyn EventSink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let categories = if categories.is_empty() {
            EventCategory::ALL.to_vec()
        } else {
            categories.to_vec()
        };
        self.subscribers.lock().push(Subscriber {
            id,
            categories,
            sink,
        });
        id
    }

    pub fn detach(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every interested subscriber
    ///
    /// The subscriber list stays locked during delivery so every
    /// subscriber sees events in emission order.
    pub fn emit(&self, event: EngineEvent) {
        let category = event.category();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !subscriber.categories.contains(&category) {
                return true;
            }
            match subscriber.sink.send(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Dropping event subscriber {}: {}", subscriber.id, e);
                    false
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
