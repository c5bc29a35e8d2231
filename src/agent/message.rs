//! Inter-agent messages.
//!
//! Grounded on `holonic_engine/agent.py`'s `Message`/`MessageHistory`:
//! a message carries a sender, a set of recipient ids, arbitrary JSON
//! content, an optional attached token allotment, and a timestamp.
//! `tokens_attached` is pure metadata here — nothing in the runtime credits
//! it to the recipient's token bank automatically (see `DESIGN.md`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A message sent from one agent to one or more others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Id of the sending agent.
    pub sender_id: Uuid,
    /// Ids of the intended recipients. Ids not present in the tree are
    /// silently dropped at delivery time.
    pub recipient_ids: Vec<Uuid>,
    /// Arbitrary JSON content.
    pub content: Value,
    /// Tokens attached to this message, as metadata only.
    pub tokens_attached: i64,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Construct a new message with a fresh id and current timestamp.
    pub fn new(sender_id: Uuid, recipient_ids: Vec<Uuid>, content: Value, tokens_attached: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            recipient_ids,
            content,
            tokens_attached,
            timestamp: Utc::now(),
        }
    }
}

/// An append-only log of messages an agent has sent or received.
#[derive(Debug, Clone, Default)]
pub struct MessageInbox {
    messages: Vec<Message>,
}

impl MessageInbox {
    /// An empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an inbox directly from a restored message list (newest-last).
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message.
    pub fn add(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// All messages, in arrival order.
    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    /// Messages addressed to `agent_id`.
    pub fn received(&self, agent_id: Uuid) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| m.recipient_ids.contains(&agent_id))
            .collect()
    }

    /// Messages sent by `agent_id`.
    pub fn sent(&self, agent_id: Uuid) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.sender_id == agent_id).collect()
    }

    /// Remove all messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if no messages are held.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_filters_by_recipient() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut inbox = MessageInbox::new();
        inbox.add(Message::new(a, vec![b], Value::Null, 0));
        assert_eq!(inbox.received(b).len(), 1);
        assert_eq!(inbox.received(a).len(), 0);
    }

    #[test]
    fn sent_filters_by_sender() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut inbox = MessageInbox::new();
        inbox.add(Message::new(a, vec![b], Value::Null, 0));
        assert_eq!(inbox.sent(a).len(), 1);
        assert_eq!(inbox.sent(b).len(), 0);
    }
}
