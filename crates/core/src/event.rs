//! Domain event system: the structured logging collaborator.
//!
//! The request loop publishes an event for every model call, tool execution,
//! optimization and error. Publishing is fire-and-forget: a missing or lagging
//! subscriber never slows down or aborts the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A user request entered the loop
    RequestStarted {
        job_id: String,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The model client returned a reply
    ModelCalled {
        job_id: String,
        iteration: u32,
        provider: String,
        model: String,
        fallback_used: bool,
        tokens_used: Option<u32>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        job_id: String,
        iteration: u32,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The context optimizer changed the transcript
    ContextOptimized {
        conversation_id: String,
        messages_removed: usize,
        summary_lines: usize,
        timestamp: DateTime<Utc>,
    },

    /// A request finished with a final answer
    RequestCompleted {
        job_id: String,
        iterations: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A request was cancelled by its job token
    RequestCancelled {
        job_id: String,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
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
        // No subscribers is fine
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
