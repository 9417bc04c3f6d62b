use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

const SEPARATOR: char = ':';

/// Canonical key for the conversation between two usernames.
///
/// The pair is unordered: the smaller name (byte order) always comes first,
/// so `between(a, b) == between(b, a)` and no allocation step is needed.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn between(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{SEPARATOR}{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A private message. Immutable once appended to a conversation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub target_user: String,
    #[serde(rename = "message")]
    pub body: String,
    pub conversation_id: ConversationId,
    pub timestamp: String,
}

impl Message {
    /// Build a new message from `sender` to `target_user`, stamped now.
    pub fn new(sender: &str, target_user: &str, body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.to_owned(),
            target_user: target_user.to_owned(),
            body: body.into(),
            conversation_id: ConversationId::between(sender, target_user),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_order_independent() {
        let pairs = [("alice", "bob"), ("Zed", "adam"), ("x", "x"), ("", "b"), ("émile", "eve")];
        for (a, b) in pairs {
            assert_eq!(ConversationId::between(a, b), ConversationId::between(b, a));
        }
    }

    #[test]
    fn conversation_id_sorts_then_joins() {
        assert_eq!(ConversationId::between("bob", "alice").as_str(), "alice:bob");
        // Uppercase sorts before lowercase in byte order.
        assert_eq!(ConversationId::between("bob", "Alice").as_str(), "Alice:bob");
        assert_eq!(ConversationId::between("sam", "sam").as_str(), "sam:sam");
    }

    #[test]
    fn new_message_fills_derived_fields() {
        let msg = Message::new("bob", "alice", "hi");
        assert_eq!(msg.sender, "bob");
        assert_eq!(msg.target_user, "alice");
        assert_eq!(msg.conversation_id.as_str(), "alice:bob");
        assert!(msg.timestamp.ends_with('Z'), "got: {}", msg.timestamp);
        assert!(chrono::DateTime::parse_from_rfc3339(&msg.timestamp).is_ok());
    }

    #[test]
    fn message_wire_shape() {
        let msg = Message::new("alice", "bob", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["targetUser"], "bob");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["conversationId"], "alice:bob");
        assert!(json["id"].as_str().unwrap().starts_with("msg_"));
        assert!(json.get("body").is_none());
    }
}
