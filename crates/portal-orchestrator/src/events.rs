//! Execution event bus.
//!
//! A `tokio::sync::broadcast` channel carrying [`ExecutionEvent`] values.
//! Any consumer (the REST SSE endpoint, a CLI progress printer, tests) can
//! subscribe independently. When no subscribers exist, events are silently
//! dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ExecutionId, ExecutionStatus, JobClass, TaskState};

/// Every event the engine emits. Serialized to JSON for SSE streaming.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    /// Admission succeeded and work is about to be scheduled.
    ExecutionStarted {
        execution_id: ExecutionId,
        job_class: JobClass,
        timestamp: String,
    },
    /// A bulk task reached a terminal state.
    TaskFinished {
        execution_id: ExecutionId,
        target: String,
        state: TaskState,
        elapsed_ms: u64,
    },
    /// A discovery visit finished (successfully or not).
    VisitFinished {
        execution_id: ExecutionId,
        point: String,
        depth: u32,
        success: bool,
        new_elements: usize,
    },
    /// A whole frontier layer was exhausted.
    LayerCompleted {
        execution_id: ExecutionId,
        depth: u32,
        elements: usize,
        next_layer: usize,
    },
    /// A stop was requested; observed at the next checkpoint.
    StopRequested { execution_id: ExecutionId },
    /// The execution reached a terminal state.
    ExecutionFinished {
        execution_id: ExecutionId,
        job_class: JobClass,
        status: ExecutionStatus,
        elapsed_ms: u64,
        error: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::TaskFinished { execution_id, .. }
            | ExecutionEvent::VisitFinished { execution_id, .. }
            | ExecutionEvent::LayerCompleted { execution_id, .. }
            | ExecutionEvent::StopRequested { execution_id }
            | ExecutionEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}

/// The central event bus.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = uuid::Uuid::new_v4();
        let event = ExecutionEvent::StopRequested { execution_id: id };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("StopRequested"));
        assert!(json.contains(&id.to_string()));
    }

    #[test]
    fn test_event_bus_emit_no_subscribers() {
        let bus = EventBus::new(16);
        bus.emit(ExecutionEvent::StopRequested {
            execution_id: uuid::Uuid::new_v4(),
        });
    }

    #[test]
    fn test_event_bus_subscribe_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = uuid::Uuid::new_v4();

        bus.emit(ExecutionEvent::LayerCompleted {
            execution_id: id,
            depth: 1,
            elements: 12,
            next_layer: 4,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.execution_id(), id);
        match event {
            ExecutionEvent::LayerCompleted { depth, .. } => assert_eq!(depth, 1),
            _ => panic!("wrong event"),
        }
    }
}
