use hierarch_core::{Message, MessageType};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Delivery log for messages travelling up the agent hierarchy.
///
/// Messages are never removed; receivers read their inbox and acknowledge
/// what they have handled.
pub struct Mailbox {
    messages: RwLock<Vec<Message>>,
}

impl Mailbox {
    /// Empty mailbox.
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Post a message and return its ID.
    pub fn post(&self, message: Message) -> Uuid {
        debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            receiver = ?message.receiver_id,
            kind = %message.message_type,
            "mailbox: posted"
        );
        let id = message.id;
        self.messages.write().push(message);
        id
    }

    /// Unacknowledged messages for a receiver (`None` = coordinator),
    /// most urgent first, then oldest first.
    pub fn inbox(&self, receiver: Option<Uuid>) -> Vec<Message> {
        let mut inbox: Vec<Message> = self
            .messages
            .read()
            .iter()
            .filter(|m| m.receiver_id == receiver && !m.acknowledged)
            .cloned()
            .collect();
        inbox.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sent_at.cmp(&b.sent_at)));
        inbox
    }

    /// Mark a message as handled. Returns `false` for unknown IDs.
    pub fn acknowledge(&self, message_id: Uuid) -> bool {
        let mut messages = self.messages.write();
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(m) => {
                m.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Every message sent by `sender` of the given kind.
    pub fn sent_by(&self, sender: Uuid, kind: MessageType) -> Vec<Message> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.sender_id == sender && m.message_type == kind)
            .cloned()
            .collect()
    }

    /// Every message ever posted, in posting order.
    pub fn all(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    /// Messages nobody has acknowledged yet.
    pub fn unacknowledged_count(&self) -> usize {
        self.messages.read().iter().filter(|m| !m.acknowledged).count()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_orders_by_priority() {
        let mailbox = Mailbox::new();
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();

        mailbox.post(Message::completion(child, Some(parent), serde_json::Value::Null));
        mailbox.post(Message::error_report(child, Some(parent), serde_json::Value::Null));
        mailbox.post(Message::new(child, None, MessageType::Heartbeat));

        let inbox = mailbox.inbox(Some(parent));
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].message_type, MessageType::ErrorReport);
        assert_eq!(mailbox.inbox(None).len(), 1);
    }

    #[test]
    fn test_acknowledge_removes_from_inbox() {
        let mailbox = Mailbox::new();
        let parent = Uuid::new_v4();
        let id = mailbox.post(Message::error_report(
            Uuid::new_v4(),
            Some(parent),
            serde_json::Value::Null,
        ));

        assert_eq!(mailbox.unacknowledged_count(), 1);
        assert!(mailbox.acknowledge(id));
        assert!(mailbox.inbox(Some(parent)).is_empty());
        assert_eq!(mailbox.all().len(), 1);
        assert!(!mailbox.acknowledge(Uuid::new_v4()));
    }

    #[test]
    fn test_sent_by_filters_kind() {
        let mailbox = Mailbox::new();
        let sender = Uuid::new_v4();
        mailbox.post(Message::error_report(sender, None, serde_json::Value::Null));
        mailbox.post(Message::completion(sender, None, serde_json::Value::Null));
        assert_eq!(mailbox.sent_by(sender, MessageType::ErrorReport).len(), 1);
        assert!(mailbox
            .sent_by(Uuid::new_v4(), MessageType::ErrorReport)
            .is_empty());
    }
}
