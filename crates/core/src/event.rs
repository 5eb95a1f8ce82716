//! Domain event system: decoupled communication between components.
//!
//! The supervisor, dispatcher and reasoning loop publish events as peers come
//! and go and tools run. The CLI subscribes to render progress on stderr.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A peer process was launched
    PeerSpawned {
        peer: String,
        pid: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// A peer finished its handshake
    PeerReady {
        peer: String,
        tools: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A peer was torn down
    PeerTerminated {
        peer: String,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool call was routed to a peer and came back (or didn't)
    ToolDispatched {
        tool: String,
        peer: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The reasoning loop started an iteration
    LoopIteration {
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// Teardown was requested
    ShutdownRequested {
        trigger: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
