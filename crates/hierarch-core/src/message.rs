use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of an inter-agent [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A task was handed to the receiving agent.
    TaskAssignment,
    /// The sender finished (or was cancelled) normally.
    TaskCompletion,
    /// The sender asks for more capacity or resources.
    ResourceRequest,
    /// A decision needs review by the receiver.
    ValidationRequest,
    /// The sender failed, timed out, or exhausted a retry budget.
    ErrorReport,
    /// Liveness signal.
    Heartbeat,
    /// The receiver should stop.
    Shutdown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskCompletion => "task_completion",
            MessageType::ResourceRequest => "resource_request",
            MessageType::ValidationRequest => "validation_request",
            MessageType::ErrorReport => "error_report",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// A message exchanged between agents in the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Agent that sent the message.
    pub sender_id: Uuid,
    /// Receiving agent; `None` addresses the coordinator itself (used by root agents).
    pub receiver_id: Option<Uuid>,
    /// What the message is about.
    pub message_type: MessageType,
    /// Delivery priority, 1 (low) to 10 (urgent).
    pub priority: u8,
    /// Structured details (task ID, error text, status, ...).
    #[serde(default)]
    pub payload: serde_json::Value,
    /// UTC timestamp of when the message was sent.
    pub sent_at: DateTime<Utc>,
    /// Whether the receiver acknowledged the message.
    #[serde(default)]
    pub acknowledged: bool,
}

impl Message {
    /// Creates a new unacknowledged message with priority 5.
    pub fn new(sender_id: Uuid, receiver_id: Option<Uuid>, message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            message_type,
            priority: 5,
            payload: serde_json::Value::Null,
            sent_at: Utc::now(),
            acknowledged: false,
        }
    }

    /// Creates an [`MessageType::ErrorReport`] with a high priority.
    pub fn error_report(
        sender_id: Uuid,
        receiver_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id, receiver_id, MessageType::ErrorReport)
            .with_priority(8)
            .with_payload(payload)
    }

    /// Creates a [`MessageType::TaskCompletion`] message.
    pub fn completion(
        sender_id: Uuid,
        receiver_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id, receiver_id, MessageType::TaskCompletion).with_payload(payload)
    }

    /// Set the priority, clamped to 1..=10.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    /// Attach a structured payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
